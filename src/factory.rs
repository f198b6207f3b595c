use std::{
    cell::RefCell,
    collections::HashMap,
    convert::Infallible,
    panic::Location,
    rc::Rc,
    sync::Arc,
};

use derive_ex::derive_ex;

use crate::{Destroyable, DestroyableId, Produced, Resource, ResourceContext, State};

#[cfg(test)]
mod tests;

/// Equality used to decide whether a cached resource can be reused for new arguments.
///
/// Plain values compare by value. Shared handles (`Rc`, `Arc`, [`State`], [`Resource`],
/// [`Destroyable`]) compare by identity, so passing a different handle to equal contents
/// creates a new resource.
pub trait ShallowEq {
    fn shallow_eq(&self, other: &Self) -> bool;
}

macro_rules! impl_shallow_eq_by_value {
    ($($t:ty),*) => {
        $(
            impl ShallowEq for $t {
                fn shallow_eq(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}
impl_shallow_eq_by_value!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    &'static str,
    DestroyableId
);

impl<T: ?Sized> ShallowEq for Rc<T> {
    fn shallow_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other)
    }
}
impl<T: ?Sized> ShallowEq for Arc<T> {
    fn shallow_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}
impl<T> ShallowEq for State<T> {
    fn shallow_eq(&self, other: &Self) -> bool {
        State::ptr_eq(self, other)
    }
}
impl<T, E> ShallowEq for Resource<T, E> {
    fn shallow_eq(&self, other: &Self) -> bool {
        Resource::ptr_eq(self, other)
    }
}
impl ShallowEq for Destroyable {
    fn shallow_eq(&self, other: &Self) -> bool {
        Destroyable::ptr_eq(self, other)
    }
}
impl<T: ShallowEq> ShallowEq for Option<T> {
    fn shallow_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.shallow_eq(b),
            (None, None) => true,
            _ => false,
        }
    }
}
impl<T: ShallowEq> ShallowEq for [T] {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| a.shallow_eq(b))
    }
}
impl<T: ShallowEq> ShallowEq for Vec<T> {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.as_slice().shallow_eq(other.as_slice())
    }
}
impl<T: ShallowEq, const N: usize> ShallowEq for [T; N] {
    fn shallow_eq(&self, other: &Self) -> bool {
        self.as_slice().shallow_eq(other.as_slice())
    }
}

macro_rules! impl_shallow_eq_for_tuple {
    ($($i:tt $t:ident),*) => {
        impl<$($t: ShallowEq),*> ShallowEq for ($($t,)*) {
            fn shallow_eq(&self, other: &Self) -> bool {
                $(self.$i.shallow_eq(&other.$i))&&*
            }
        }
    };
}
impl_shallow_eq_for_tuple!(0 A0);
impl_shallow_eq_for_tuple!(0 A0, 1 A1);
impl_shallow_eq_for_tuple!(0 A0, 1 A1, 2 A2);
impl_shallow_eq_for_tuple!(0 A0, 1 A1, 2 A2, 3 A3);
impl_shallow_eq_for_tuple!(0 A0, 1 A1, 2 A2, 3 A3, 4 A4);
impl_shallow_eq_for_tuple!(0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
struct CacheSlot {
    site: &'static Location<'static>,
    owner: DestroyableId,
}

struct CacheEntry<A, T: 'static, E: 'static> {
    args: Rc<A>,
    resource: Resource<T, E>,
}

type Cache<A, T, E> = RefCell<HashMap<CacheSlot, CacheEntry<A, T, E>>>;
type FactoryFn<A, T, E> = dyn Fn(&A, &mut ResourceContext) -> Result<Produced<T>, E>;

/// Creates resources from positional arguments, keeping at most one live resource
/// per call site and owner.
///
/// See [`ResourceFactory::call`].
pub fn resource_factory<A, T>(
    f: impl Fn(&A, &mut ResourceContext) -> T + 'static,
) -> ResourceFactory<A, T>
where
    A: ShallowEq + 'static,
    T: 'static,
{
    ResourceFactory::from_fn(move |args, cx| Ok(Produced::Value(f(args, cx))))
}

/// Same as [`resource_factory`], for resource functions that can fail.
pub fn try_resource_factory<A, T, E>(
    f: impl Fn(&A, &mut ResourceContext) -> Result<T, E> + 'static,
) -> ResourceFactory<A, T, E>
where
    A: ShallowEq + 'static,
    T: 'static,
    E: 'static,
{
    ResourceFactory::from_fn(move |args, cx| f(args, cx).map(Produced::Value))
}

#[derive_ex(Clone, bound())]
pub struct ResourceFactory<A: 'static, T: 'static, E: 'static = Infallible> {
    f: Rc<FactoryFn<A, T, E>>,
    cache: Rc<Cache<A, T, E>>,
}

impl<A, T, E> ResourceFactory<A, T, E>
where
    A: ShallowEq + 'static,
    T: 'static,
    E: 'static,
{
    pub fn from_fn(
        f: impl Fn(&A, &mut ResourceContext) -> Result<Produced<T>, E> + 'static,
    ) -> Self {
        Self {
            f: Rc::new(f),
            cache: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Returns the resource for this call site and `owner`.
    ///
    /// If the previous call from the same call site with the same owner passed
    /// shallow-equal arguments, the same resource is returned. Otherwise the previous
    /// resource is destroyed and a new one is created as a child of `owner`.
    ///
    /// When `owner` is destroyed, its resources are destroyed and forgotten.
    #[track_caller]
    pub fn call(&self, owner: &Destroyable, args: A) -> Resource<T, E> {
        let slot = CacheSlot {
            site: Location::caller(),
            owner: owner.id(),
        };
        if owner.is_destroying() {
            return self.create(owner, Rc::new(args));
        }
        let previous = match self.cache.borrow().get(&slot) {
            Some(e) if !e.resource.is_destroyed() && A::shallow_eq(&e.args, &args) => {
                return e.resource.clone();
            }
            Some(e) => Some(e.resource.clone()),
            None => None,
        };
        if let Some(previous) = previous {
            tracing::trace!(site = %slot.site, owner = %slot.owner, "arguments changed, replacing resource");
            previous.destroy();
        }

        let args = Rc::new(args);
        let resource = self.create(owner, args.clone());
        let cache = Rc::downgrade(&self.cache);
        let id = resource.destroyable().id();
        resource.destroyable().register_destructor(move || {
            let Some(cache) = cache.upgrade() else {
                return;
            };
            let mut cache = cache.borrow_mut();
            if cache
                .get(&slot)
                .is_some_and(|e| e.resource.destroyable().id() == id)
            {
                let removed = cache.remove(&slot);
                drop(cache);
                drop(removed);
            }
        });
        let replaced = self.cache.borrow_mut().insert(
            slot,
            CacheEntry {
                args,
                resource: resource.clone(),
            },
        );
        drop(replaced);
        resource
    }

    fn create(&self, owner: &Destroyable, args: Rc<A>) -> Resource<T, E> {
        let f = self.f.clone();
        Resource::from_produced(owner, move |cx| f(&args, cx))
    }

    /// Number of live cached resources.
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
