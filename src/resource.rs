use std::{
    cell::RefCell,
    convert::Infallible,
    mem::replace,
    rc::Rc,
};

use derive_ex::derive_ex;

use crate::{
    core::{
        BindKey, BindSink, BindSource, DirtyOrMaybeDirty, NotifyContext, SinkBindings, Slot,
        SourceBinder, UpdateContext,
    },
    Destroyable, InvalidCleanupRegistration, ResourceError, SignalContext,
};

#[cfg(test)]
mod tests;

const SLOT_DEPS: Slot = Slot(0);
const SLOT_VALUE: Slot = Slot(0);

/// What a resource function hands back to the runtime.
pub enum Produced<T> {
    /// A new value.
    Value(T),
    /// A function whose result becomes the value. It is called once, right after the resource function.
    Thunk(Box<dyn FnOnce() -> T>),
    /// An existing shared value. If it is the value already held, dependents are not invalidated.
    Shared(Rc<T>),
}

impl<T> Produced<T> {
    pub fn thunk(f: impl FnOnce() -> T + 'static) -> Self {
        Produced::Thunk(Box::new(f))
    }
    fn into_rc(self) -> Rc<T> {
        match self {
            Produced::Value(value) => Rc::new(value),
            Produced::Thunk(f) => Rc::new(f()),
            Produced::Shared(value) => value,
        }
    }
}
impl<T> From<T> for Produced<T> {
    fn from(value: T) -> Self {
        Produced::Value(value)
    }
}

/// Cleanup registration point of one evaluation of a resource function.
///
/// `Hooks` can be cloned and moved into asynchronous work, but registration is only
/// accepted while the evaluation that created it is running.
#[derive(Clone)]
pub struct Hooks(Rc<RefCell<HooksData>>);

struct HooksData {
    is_active: bool,
    cleanups: Vec<Box<dyn FnOnce()>>,
}

impl Hooks {
    fn new() -> Self {
        Self(Rc::new(RefCell::new(HooksData {
            is_active: true,
            cleanups: Vec::new(),
        })))
    }

    /// Returns `true` while the evaluation that owns these hooks is running.
    pub fn is_active(&self) -> bool {
        self.0.borrow().is_active
    }

    /// Registers `f` to run when this evaluation is torn down.
    ///
    /// Cleanups run in reverse registration order.
    pub fn try_on_cleanup(
        &self,
        f: impl FnOnce() + 'static,
    ) -> Result<(), InvalidCleanupRegistration> {
        let mut d = self.0.borrow_mut();
        if !d.is_active {
            return Err(InvalidCleanupRegistration {});
        }
        d.cleanups.push(Box::new(f));
        Ok(())
    }

    /// Registers `f` to run when this evaluation is torn down.
    ///
    /// # Panics
    ///
    /// Panics if the evaluation has already finished.
    #[track_caller]
    pub fn on_cleanup(&self, f: impl FnOnce() + 'static) {
        if let Err(e) = self.try_on_cleanup(f) {
            panic!("{e}");
        }
    }

    fn finish(&self) {
        self.0.borrow_mut().is_active = false;
    }
    fn pop_cleanup(&self) -> Option<Box<dyn FnOnce()>> {
        self.0.borrow_mut().cleanups.pop()
    }
    fn run_cleanups(&self) {
        self.finish();
        while let Some(f) = self.pop_cleanup() {
            f();
        }
    }
}

/// One run of a resource function: its cleanups and the objects it owns.
struct Invocation {
    owner: Destroyable,
    hooks: Hooks,
}

impl Invocation {
    fn start(parent: &Destroyable) -> Self {
        let owner = Destroyable::new();
        let hooks = Hooks::new();
        owner.register_destructor({
            let hooks = hooks.clone();
            move || hooks.run_cleanups()
        });
        parent.associate_child(&owner);
        Self { owner, hooks }
    }
    fn teardown(self) {
        if !self.owner.is_destroying() {
            self.owner.destroy();
        }
    }
}

/// Argument of a resource function.
pub struct ResourceContext<'a, 's> {
    sc: &'a mut SignalContext<'s>,
    invocation: &'a Invocation,
}

impl<'s> ResourceContext<'_, 's> {
    /// Tracking scope of this evaluation. Reads through it re-run the resource when they change.
    pub fn sc(&mut self) -> &mut SignalContext<'s> {
        self.sc
    }

    /// Registers `f` to run before the next evaluation, or when the resource is destroyed.
    #[track_caller]
    pub fn on_cleanup(&self, f: impl FnOnce() + 'static) {
        self.invocation.hooks.on_cleanup(f)
    }

    /// Returns a handle for registering cleanups from work started by this evaluation.
    pub fn hooks(&self) -> Hooks {
        self.invocation.hooks.clone()
    }

    /// Owner of this evaluation.
    ///
    /// Anything associated with it is destroyed together with this evaluation.
    pub fn owner(&self) -> &Destroyable {
        &self.invocation.owner
    }
}

type ResourceFn<T, E> = dyn FnMut(&mut ResourceContext) -> Result<Produced<T>, E>;

/// A value derived from a function whose lifecycle follows its dependencies and its owner.
///
/// The function runs on the first read of [`current`](Self::current), and again on a read
/// after any of its tracked dependencies has changed. Before it runs again, the cleanups
/// registered by the previous run are executed.
///
/// The resource is a child of its owner and is destroyed with it.
/// Dropping every handle also destroys it.
#[derive_ex(Clone, bound())]
pub struct Resource<T: 'static, E: 'static = Infallible>(Rc<ResourceNode<T, E>>);

impl<T: 'static> Resource<T> {
    pub fn new(owner: &Destroyable, mut f: impl FnMut(&mut ResourceContext) -> T + 'static) -> Self {
        Self::from_produced(owner, move |cx| Ok(Produced::Value(f(cx))))
    }

    /// Same as [`current`](Self::current), for resources whose function cannot fail.
    ///
    /// Returns `None` once the resource has been destroyed.
    pub fn get(&self, sc: &mut SignalContext) -> Option<Rc<T>> {
        self.current(sc).ok()
    }
}

impl<T: 'static, E: 'static> Resource<T, E> {
    pub fn try_new(
        owner: &Destroyable,
        mut f: impl FnMut(&mut ResourceContext) -> Result<T, E> + 'static,
    ) -> Self {
        Self::from_produced(owner, move |cx| f(cx).map(Produced::Value))
    }
    pub fn from_produced(
        owner: &Destroyable,
        f: impl FnMut(&mut ResourceContext) -> Result<Produced<T>, E> + 'static,
    ) -> Self {
        Self::from_boxed(owner, Box::new(f))
    }
    fn from_boxed(owner: &Destroyable, f: Box<ResourceFn<T, E>>) -> Self {
        let node = Rc::new_cyclic(|this| ResourceNode {
            destroyable: Destroyable::new(),
            f: RefCell::new(f),
            sb: RefCell::new(SourceBinder::new(this, SLOT_DEPS)),
            data: RefCell::new(ResourceData {
                value: None,
                invocation: None,
                evaluations: 0,
                pending_error: None,
            }),
            sinks: RefCell::new(SinkBindings::new()),
        });
        let this = Rc::downgrade(&node);
        node.destroyable.register_destructor(move || {
            if let Some(node) = this.upgrade() {
                node.release();
            }
        });
        owner.associate_child(&node.destroyable);
        Self(node)
    }

    /// Returns the current value, evaluating the resource function if it is stale,
    /// and adds a dependency on this resource to `sc`.
    ///
    /// Reading twice without a dependency change returns the same `Rc`.
    pub fn current(&self, sc: &mut SignalContext) -> Result<Rc<T>, ResourceError<E>> {
        let result = self.0.update(sc.uc());
        self.0
            .sinks
            .borrow_mut()
            .bind(self.0.clone(), SLOT_VALUE, sc);
        result?;
        self.0
            .data
            .borrow()
            .value
            .clone()
            .ok_or(ResourceError::Destroyed)
    }

    /// Same as [`current`](Self::current), without adding a dependency.
    pub fn current_untracked(&self, sc: &mut SignalContext) -> Result<Rc<T>, ResourceError<E>> {
        sc.untrack(|sc| self.current(sc))
    }

    pub fn destroyable(&self) -> &Destroyable {
        &self.0.destroyable
    }
    pub fn destroy(&self) {
        self.0.destroyable.destroy()
    }
    pub fn is_destroyed(&self) -> bool {
        self.0.destroyable.is_destroyed()
    }

    /// Number of times the resource function has been called.
    pub fn evaluations(&self) -> usize {
        self.0.data.borrow().evaluations
    }

    /// Returns `true` if both handles refer to the same resource.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Rc::ptr_eq(&this.0, &other.0)
    }
}

impl<T: 'static, E: 'static> std::fmt::Debug for Resource<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.0.destroyable.id())
            .field("phase", &self.0.destroyable.phase())
            .field("evaluations", &self.evaluations())
            .finish()
    }
}

struct ResourceData<T, E> {
    value: Option<Rc<T>>,
    invocation: Option<Invocation>,
    evaluations: usize,
    /// Error of an evaluation started by a dependent's check, kept for the read that follows.
    pending_error: Option<E>,
}

struct ResourceNode<T: 'static, E: 'static> {
    destroyable: Destroyable,
    f: RefCell<Box<ResourceFn<T, E>>>,
    sb: RefCell<SourceBinder>,
    data: RefCell<ResourceData<T, E>>,
    sinks: RefCell<SinkBindings>,
}

impl<T: 'static, E: 'static> ResourceNode<T, E> {
    /// Brings the value up to date. Returns `true` if the value was replaced.
    fn update(self: &Rc<Self>, uc: &mut UpdateContext) -> Result<bool, ResourceError<E>> {
        if self.destroyable.is_destroying() {
            return Err(ResourceError::Destroyed);
        }
        let (has_value, pending_error) = {
            let mut d = self.data.borrow_mut();
            (d.value.is_some(), d.pending_error.take())
        };
        if has_value || pending_error.is_some() {
            if !uc.borrow_mut(&self.sb).check(uc) {
                if let Some(e) = pending_error {
                    return Err(ResourceError::Evaluation(e));
                }
                self.sinks.borrow_mut().update(false);
                return Ok(false);
            }
        }

        let previous = self.data.borrow_mut().invocation.take();
        if let Some(previous) = previous {
            tracing::debug!(resource = %self.destroyable.id(), "tearing down previous evaluation");
            previous.teardown();
        }
        if self.destroyable.is_destroying() {
            return Err(ResourceError::Destroyed);
        }

        let invocation = Invocation::start(&self.destroyable);
        let evaluation = {
            let mut d = self.data.borrow_mut();
            d.evaluations += 1;
            d.evaluations
        };
        tracing::debug!(resource = %self.destroyable.id(), evaluation, "evaluating resource");
        let result = {
            let mut f_ref = uc.borrow_mut(&self.f);
            let f = &mut **f_ref;
            let mut sb = uc.borrow_mut(&self.sb);
            sb.update(
                |sc| {
                    let mut cx = ResourceContext {
                        sc,
                        invocation: &invocation,
                    };
                    f(&mut cx).map(Produced::into_rc)
                },
                uc,
            )
        };
        invocation.hooks.finish();

        match result {
            Ok(value) => {
                if self.destroyable.is_destroying() {
                    invocation.teardown();
                    return Err(ResourceError::Destroyed);
                }
                let (changed, old) = {
                    let mut d = self.data.borrow_mut();
                    let changed = !d.value.as_ref().is_some_and(|old| Rc::ptr_eq(old, &value));
                    d.invocation = Some(invocation);
                    (changed, replace(&mut d.value, Some(value)))
                };
                drop(old);
                self.sinks.borrow_mut().update(changed);
                Ok(changed)
            }
            Err(e) => {
                tracing::debug!(resource = %self.destroyable.id(), evaluation, "resource function failed");
                invocation.teardown();
                let old = self.data.borrow_mut().value.take();
                drop(old);
                self.sinks.borrow_mut().update(true);
                Err(ResourceError::Evaluation(e))
            }
        }
    }

    fn release(&self) {
        let (value, invocation, pending_error) = {
            let mut d = self.data.borrow_mut();
            (d.value.take(), d.invocation.take(), d.pending_error.take())
        };
        drop(pending_error);
        if let Some(invocation) = invocation {
            invocation.teardown();
        }
        drop(value);
        if let Ok(mut sb) = self.sb.try_borrow_mut() {
            sb.clear();
        }
        tracing::debug!(resource = %self.destroyable.id(), "resource released");
    }
}

impl<T: 'static, E: 'static> BindSink for ResourceNode<T, E> {
    fn notify(self: Rc<Self>, slot: Slot, dirty: DirtyOrMaybeDirty, nc: &mut NotifyContext) {
        if self.sb.borrow_mut().on_notify(slot, dirty) {
            self.sinks
                .borrow_mut()
                .notify(DirtyOrMaybeDirty::MaybeDirty, nc);
        }
    }
}

impl<T: 'static, E: 'static> BindSource for ResourceNode<T, E> {
    fn check(self: Rc<Self>, _slot: Slot, key: BindKey, uc: &mut UpdateContext) -> bool {
        match self.update(uc) {
            Ok(_) => self.sinks.borrow().is_dirty(key),
            Err(ResourceError::Evaluation(e)) => {
                self.data.borrow_mut().pending_error = Some(e);
                true
            }
            Err(ResourceError::Destroyed) => true,
        }
    }

    fn unbind(self: Rc<Self>, _slot: Slot, key: BindKey) {
        self.sinks.borrow_mut().unbind(key);
    }
}

impl<T: 'static, E: 'static> Drop for ResourceNode<T, E> {
    fn drop(&mut self) {
        self.destroyable.destroy();
    }
}
