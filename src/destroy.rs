use std::{
    cell::{Cell, RefCell},
    mem::take,
    rc::{Rc, Weak},
};

use parse_display::Display;


thread_local! {
    static NEXT_ID: Cell<u64> = const { Cell::new(0) };
}

/// Identity of a [`Destroyable`], unique within a thread.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Display)]
#[display("#{0}")]
pub struct DestroyableId(u64);

impl DestroyableId {
    fn next() -> Self {
        NEXT_ID.with(|id| {
            let value = id.get();
            id.set(value + 1);
            DestroyableId(value)
        })
    }
}

/// Lifecycle phase of a [`Destroyable`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
pub enum DestroyPhase {
    Live,
    Destroying,
    Destroyed,
}

/// Key returned by [`Destroyable::register_destructor`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DestructorKey(usize);

/// A node of the destroyable graph.
///
/// Every destroyable owns an ordered list of children and an ordered list of destructors.
/// [`destroy`](Self::destroy) tears down the children first, in association order,
/// then runs the destructors in registration order.
///
/// Cloning yields another handle to the same node. Dropping the last handle destroys it.
#[derive(Clone)]
pub struct Destroyable(Rc<DestroyableNode>);

struct DestroyableNode {
    id: DestroyableId,
    data: RefCell<DestroyableData>,
}

#[allow(clippy::type_complexity)]
struct DestroyableData {
    phase: DestroyPhase,
    parent: Option<Weak<DestroyableNode>>,
    children: Vec<Destroyable>,
    destructors: Vec<Option<Box<dyn FnOnce()>>>,
}

impl Destroyable {
    pub fn new() -> Self {
        Self(Rc::new(DestroyableNode {
            id: DestroyableId::next(),
            data: RefCell::new(DestroyableData {
                phase: DestroyPhase::Live,
                parent: None,
                children: Vec::new(),
                destructors: Vec::new(),
            }),
        }))
    }

    pub fn id(&self) -> DestroyableId {
        self.0.id
    }
    pub fn phase(&self) -> DestroyPhase {
        self.0.data.borrow().phase
    }

    /// Returns `true` once destruction has started, including after it has finished.
    pub fn is_destroying(&self) -> bool {
        self.phase() != DestroyPhase::Live
    }
    /// Returns `true` once every child and destructor has been torn down.
    pub fn is_destroyed(&self) -> bool {
        self.phase() == DestroyPhase::Destroyed
    }

    /// Makes `child` part of this destroyable's teardown.
    ///
    /// If this destroyable is already being destroyed, `child` is destroyed immediately.
    ///
    /// # Panics
    ///
    /// Panics if `child` already has a parent.
    pub fn associate_child(&self, child: &Destroyable) {
        if child.is_destroying() {
            return;
        }
        {
            let mut c = child.0.data.borrow_mut();
            if c.parent.is_some() {
                panic!("Destroyable {} already has a parent.", child.id());
            }
            c.parent = Some(Rc::downgrade(&self.0));
        }
        let mut d = self.0.data.borrow_mut();
        if d.phase == DestroyPhase::Live {
            d.children.push(child.clone());
        } else {
            drop(d);
            child.destroy();
        }
    }

    /// Registers a function called when this destroyable is destroyed.
    ///
    /// If this destroyable has already been destroyed, `f` is called immediately.
    pub fn register_destructor(&self, f: impl FnOnce() + 'static) -> DestructorKey {
        let mut d = self.0.data.borrow_mut();
        if d.phase == DestroyPhase::Destroyed {
            drop(d);
            f();
            return DestructorKey(usize::MAX);
        }
        let key = DestructorKey(d.destructors.len());
        d.destructors.push(Some(Box::new(f)));
        key
    }

    /// Removes a destructor that has not run yet.
    ///
    /// Returns `true` if the destructor was removed.
    pub fn unregister_destructor(&self, key: DestructorKey) -> bool {
        let mut d = self.0.data.borrow_mut();
        match d.destructors.get_mut(key.0) {
            Some(f) => f.take().is_some(),
            None => false,
        }
    }

    /// Destroys this destroyable, its children, and runs its destructors.
    ///
    /// Destroying a destroyable that is being destroyed, or has been destroyed, does nothing.
    /// This includes calls made from a destructor of the destroyable itself.
    pub fn destroy(&self) {
        self.0.destroy()
    }

    /// Returns `true` if both handles refer to the same node.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Rc::ptr_eq(&this.0, &other.0)
    }

    /// Number of live children.
    pub fn children_len(&self) -> usize {
        self.0.data.borrow().children.len()
    }
}

impl DestroyableNode {
    fn destroy(&self) {
        let children = {
            let mut d = self.data.borrow_mut();
            if d.phase != DestroyPhase::Live {
                return;
            }
            d.phase = DestroyPhase::Destroying;
            take(&mut d.children)
        };
        tracing::debug!(id = %self.id, children = children.len(), "destroying");
        for child in children {
            child.destroy();
        }
        let mut index = 0;
        loop {
            let f = {
                let mut d = self.data.borrow_mut();
                let Some(f) = d.destructors.get_mut(index) else {
                    d.destructors.clear();
                    break;
                };
                f.take()
            };
            if let Some(f) = f {
                f();
            }
            index += 1;
        }
        let parent = {
            let mut d = self.data.borrow_mut();
            d.phase = DestroyPhase::Destroyed;
            d.parent.take()
        };
        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            if let Ok(mut p) = parent.data.try_borrow_mut() {
                p.children.retain(|c| c.id() != self.id);
            }
        }
    }
}

impl Drop for DestroyableNode {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Default for Destroyable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Destroyable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destroyable")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}
