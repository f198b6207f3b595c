use std::{cell::RefCell, convert::Infallible, future::Future, rc::Rc};

use derive_ex::derive_ex;
use futures::{future::LocalBoxFuture, FutureExt};
use parse_display::Display;
use serde::Serialize;

use crate::{spawn_action, ActionContext, Destroyable, SignalContext, State};


/// Progress of an [`AsyncState`], without the payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
#[display(style = "UPPERCASE")]
pub enum AsyncStatus {
    Unstarted,
    Pending,
    Resolved,
    Rejected,
}

impl Serialize for AsyncStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Progress of an [`AsyncState`] together with the settled value or error.
#[derive(Debug)]
#[derive_ex(Clone, bound())]
pub enum AsyncResult<T, E> {
    Unstarted,
    Pending,
    Resolved(Rc<T>),
    Rejected(Rc<E>),
}

impl<T, E> AsyncResult<T, E> {
    pub fn status(&self) -> AsyncStatus {
        match self {
            AsyncResult::Unstarted => AsyncStatus::Unstarted,
            AsyncResult::Pending => AsyncStatus::Pending,
            AsyncResult::Resolved(_) => AsyncStatus::Resolved,
            AsyncResult::Rejected(_) => AsyncStatus::Rejected,
        }
    }
    pub fn value(&self) -> Option<&Rc<T>> {
        match self {
            AsyncResult::Resolved(value) => Some(value),
            _ => None,
        }
    }
    pub fn error(&self) -> Option<&Rc<E>> {
        match self {
            AsyncResult::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

type SourceFn<T, E> =
    dyn FnMut(&mut SignalContext) -> Result<LocalBoxFuture<'static, Result<T, E>>, E>;

/// Tracks the latest future produced by a source function.
///
/// Each [`retry`](Self::retry) calls the source function and replaces the current result with
/// a new pending one. When a future settles after a newer one has been started, its outcome is
/// discarded.
///
/// Reads of the result through a [`SignalContext`] are tracked.
#[derive_ex(Clone, bound())]
pub struct AsyncState<T: 'static, E: 'static = Infallible>(Rc<AsyncStateNode<T, E>>);

impl<T: 'static> AsyncState<T> {
    pub fn new<Fut>(
        owner: &Destroyable,
        mut f: impl FnMut(&mut SignalContext) -> Fut + 'static,
    ) -> Self
    where
        Fut: Future<Output = T> + 'static,
    {
        Self::from_boxed(owner, Box::new(move |sc| Ok(f(sc).map(Ok).boxed_local())))
    }
}

impl<T: 'static, E: 'static> AsyncState<T, E> {
    /// Creates an `AsyncState` whose source function can fail before producing a future,
    /// and whose future can settle with an error.
    pub fn try_new<Fut>(
        owner: &Destroyable,
        mut f: impl FnMut(&mut SignalContext) -> Result<Fut, E> + 'static,
    ) -> Self
    where
        Fut: Future<Output = Result<T, E>> + 'static,
    {
        Self::from_boxed(owner, Box::new(move |sc| Ok(f(sc)?.boxed_local())))
    }
    fn from_boxed(owner: &Destroyable, source: Box<SourceFn<T, E>>) -> Self {
        let this = Self::detached(source);
        owner.associate_child(&this.0.destroyable);
        this
    }
    pub(crate) fn detached(source: Box<SourceFn<T, E>>) -> Self {
        Self(Rc::new(AsyncStateNode {
            destroyable: Destroyable::new(),
            source: RefCell::new(source),
            current: State::new(None),
        }))
    }

    /// Calls the source function and starts tracking the future it returns.
    ///
    /// The source function is called with `sc`, so the values it reads before returning
    /// become dependencies of the caller. The previous result is replaced during the next
    /// [`Runtime::flush`](crate::Runtime::flush); until then, readers keep seeing it.
    ///
    /// If the source function fails, the error is returned and the state is left unchanged.
    pub fn retry(&self, sc: &mut SignalContext) -> Result<(), E> {
        if self.0.destroyable.is_destroying() {
            return Ok(());
        }
        let fut = {
            let mut source = sc.uc().borrow_mut(&self.0.source);
            (*source)(sc)?
        };
        let node = Rc::downgrade(&self.0);
        spawn_action(move |ac| {
            if let Some(node) = node.upgrade() {
                node.commit(fut, ac);
            }
        });
        Ok(())
    }

    pub fn result(&self, sc: &mut SignalContext) -> AsyncResult<T, E> {
        match self.0.current.get(sc) {
            Some(run) => run.outcome.get(sc),
            None => AsyncResult::Unstarted,
        }
    }
    pub fn status(&self, sc: &mut SignalContext) -> AsyncStatus {
        self.result(sc).status()
    }
    pub fn value(&self, sc: &mut SignalContext) -> Option<Rc<T>> {
        self.result(sc).value().cloned()
    }
    pub fn error(&self, sc: &mut SignalContext) -> Option<Rc<E>> {
        self.result(sc).error().cloned()
    }
    pub fn is_pending(&self, sc: &mut SignalContext) -> bool {
        self.status(sc) == AsyncStatus::Pending
    }
    pub fn is_resolved(&self, sc: &mut SignalContext) -> bool {
        self.status(sc) == AsyncStatus::Resolved
    }
    pub fn is_rejected(&self, sc: &mut SignalContext) -> bool {
        self.status(sc) == AsyncStatus::Rejected
    }
    /// Returns `true` if the current future has settled.
    pub fn is_finished(&self, sc: &mut SignalContext) -> bool {
        matches!(
            self.status(sc),
            AsyncStatus::Resolved | AsyncStatus::Rejected
        )
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
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Rc::ptr_eq(&this.0, &other.0)
    }
}

impl<T: 'static, E: 'static> std::fmt::Debug for AsyncState<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self.0.current.get_untracked() {
            Some(run) => run.outcome.with_untracked(|r| r.status()),
            None => AsyncStatus::Unstarted,
        };
        f.debug_struct("AsyncState")
            .field("id", &self.0.destroyable.id())
            .field("status", &status)
            .finish()
    }
}

struct AsyncStateNode<T: 'static, E: 'static> {
    destroyable: Destroyable,
    source: RefCell<Box<SourceFn<T, E>>>,
    current: State<Option<Rc<AsyncRun<T, E>>>>,
}

impl<T: 'static, E: 'static> AsyncStateNode<T, E> {
    fn commit(
        self: &Rc<Self>,
        fut: LocalBoxFuture<'static, Result<T, E>>,
        ac: &mut ActionContext,
    ) {
        let previous = self.current.get_untracked();
        if let Some(previous) = &previous {
            if !previous.destroyable.is_destroying() {
                previous.destroyable.destroy();
            }
        }
        if self.destroyable.is_destroying() {
            if previous.is_some() {
                self.current.set(None, ac);
            }
            return;
        }
        let run = Rc::new(AsyncRun {
            destroyable: Destroyable::new(),
            outcome: State::new(AsyncResult::Pending),
        });
        self.destroyable.associate_child(&run.destroyable);
        self.current.set(Some(run.clone()), ac);

        let node = Rc::downgrade(self);
        ac.spawn_async(move |aac| async move {
            let result = fut.await;
            aac.call(|ac| {
                if let Some(node) = node.upgrade() {
                    node.settle(&run, result, ac);
                }
            });
        });
    }

    fn settle(&self, run: &Rc<AsyncRun<T, E>>, result: Result<T, E>, ac: &mut ActionContext) {
        let is_current = self
            .current
            .with_untracked(|c| c.as_ref().is_some_and(|c| Rc::ptr_eq(c, run)));
        if !is_current || run.destroyable.is_destroying() {
            tracing::trace!(state = %self.destroyable.id(), run = %run.destroyable.id(), "discarding stale settlement");
            return;
        }
        let outcome = match result {
            Ok(value) => AsyncResult::Resolved(Rc::new(value)),
            Err(e) => AsyncResult::Rejected(Rc::new(e)),
        };
        tracing::trace!(state = %self.destroyable.id(), status = %outcome.status(), "settled");
        run.outcome.set(outcome, ac);
    }
}

impl<T: 'static, E: 'static> Drop for AsyncStateNode<T, E> {
    fn drop(&mut self) {
        self.destroyable.destroy();
    }
}

/// The result of one call of the source function.
struct AsyncRun<T: 'static, E: 'static> {
    destroyable: Destroyable,
    outcome: State<AsyncResult<T, E>>,
}
