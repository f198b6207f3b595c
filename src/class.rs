use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use derive_ex::derive_ex;
use parse_display::Display;

use crate::{Destroyable, Produced, Resource, ResourceContext, SignalContext};


/// Lifecycle phase of a [`ClassResource`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
pub enum ClassPhase {
    /// Created, but never read.
    Constructed,
    Active,
    /// [`Lifecycle::update`] is running.
    Updating,
    Destroyed,
}

/// What [`Lifecycle::update`] decided to do with the instance.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum Update {
    /// The instance was brought up to date in place.
    Kept,
    /// The instance is torn down and a new one is set up.
    #[default]
    Recreate,
}

/// An object managed by a [`ClassResource`].
///
/// Values read through [`ResourceContext::sc`] in `setup` and `update` are dependencies of
/// the instance. Cleanups registered through the context run before the next `update`.
pub trait Lifecycle: Sized + 'static {
    fn setup(cx: &mut ResourceContext) -> Self;

    fn update(&mut self, cx: &mut ResourceContext) -> Update {
        let _ = cx;
        Update::Recreate
    }

    fn teardown(&mut self) {}
}

/// A resource backed by an object with explicit `setup`, `update` and `teardown`.
#[derive_ex(Clone, bound())]
pub struct ClassResource<C: Lifecycle> {
    resource: Resource<Rc<RefCell<C>>>,
    shared: Rc<ClassShared<C>>,
}

struct ClassShared<C> {
    phase: Cell<ClassPhase>,
    instance: RefCell<Option<Rc<RefCell<C>>>>,
}

impl<C: Lifecycle> ClassResource<C> {
    pub fn new(owner: &Destroyable) -> Self {
        let shared = Rc::new(ClassShared {
            phase: Cell::new(ClassPhase::Constructed),
            instance: RefCell::new(None),
        });
        let resource = Resource::from_produced(owner, {
            let shared = shared.clone();
            move |cx| Ok(Produced::Value(shared.evaluate(cx)))
        });
        let weak = Rc::downgrade(&shared);
        resource.destroyable().register_destructor(move || {
            if let Some(shared) = weak.upgrade() {
                shared.destroy();
            }
        });
        Self { resource, shared }
    }

    /// Returns the up-to-date instance, or `None` if this resource has been destroyed.
    pub fn current(&self, sc: &mut SignalContext) -> Option<Rc<RefCell<C>>> {
        self.resource.current(sc).ok().map(|c| (*c).clone())
    }

    /// Calls `f` with the up-to-date instance.
    pub fn with<U>(&self, sc: &mut SignalContext, f: impl FnOnce(&C) -> U) -> Option<U> {
        let instance = self.current(sc)?;
        let instance = instance.borrow();
        Some(f(&instance))
    }

    pub fn phase(&self) -> ClassPhase {
        self.shared.phase.get()
    }
    pub fn destroy(&self) {
        self.resource.destroy()
    }
    pub fn is_destroyed(&self) -> bool {
        self.resource.is_destroyed()
    }
}

impl<C: Lifecycle> ClassShared<C> {
    fn evaluate(&self, cx: &mut ResourceContext) -> Rc<RefCell<C>> {
        let current = self.instance.borrow().clone();
        if let Some(instance) = current {
            self.phase.set(ClassPhase::Updating);
            let update = instance.borrow_mut().update(cx);
            match update {
                Update::Kept => {
                    self.phase.set(ClassPhase::Active);
                    return instance;
                }
                Update::Recreate => self.teardown_instance(),
            }
        }
        let instance = Rc::new(RefCell::new(C::setup(cx)));
        *self.instance.borrow_mut() = Some(instance.clone());
        self.phase.set(ClassPhase::Active);
        instance
    }
    fn teardown_instance(&self) {
        let instance = self.instance.borrow_mut().take();
        if let Some(instance) = instance {
            instance.borrow_mut().teardown();
        }
    }
    fn destroy(&self) {
        self.teardown_instance();
        self.phase.set(ClassPhase::Destroyed);
    }
}

impl<C: Lifecycle> std::fmt::Debug for ClassResource<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassResource")
            .field("phase", &self.phase())
            .field("resource", &self.resource)
            .finish()
    }
}
