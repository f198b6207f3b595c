use std::{convert::Infallible, future::Future, rc::Rc};

use derive_ex::derive_ex;
use futures::FutureExt;

use crate::{
    AsyncResult, AsyncState, AsyncStatus, Destroyable, Produced, Resource, ResourceError,
    SignalContext,
};

/// Creates a [`TrackedFunction`] from an asynchronous function.
///
/// `f` is called with a tracking [`SignalContext`]. Whenever a value it read before returning
/// its future changes, `f` is called again on the next read and the result of the previous
/// future is discarded.
pub fn tracked_function<T, Fut>(
    owner: &Destroyable,
    mut f: impl FnMut(&mut SignalContext) -> Fut + 'static,
) -> TrackedFunction<T>
where
    T: 'static,
    Fut: Future<Output = T> + 'static,
{
    TrackedFunction::from_state(
        owner,
        AsyncState::detached(Box::new(move |sc| Ok(f(sc).map(Ok).boxed_local()))),
    )
}

/// Same as [`tracked_function`], for functions that can fail.
///
/// A failure before the future is returned is reported by [`TrackedFunction::result`]
/// and leaves the last result in place. A failure of the future is reported as
/// [`AsyncResult::Rejected`].
pub fn try_tracked_function<T, E, Fut>(
    owner: &Destroyable,
    mut f: impl FnMut(&mut SignalContext) -> Result<Fut, E> + 'static,
) -> TrackedFunction<T, E>
where
    T: 'static,
    E: 'static,
    Fut: Future<Output = Result<T, E>> + 'static,
{
    TrackedFunction::from_state(
        owner,
        AsyncState::detached(Box::new(move |sc| Ok(f(sc)?.boxed_local()))),
    )
}

/// An [`AsyncState`] that is retried whenever the dependencies of its source function change.
#[derive_ex(Clone, bound())]
pub struct TrackedFunction<T: 'static, E: 'static = Infallible> {
    state: AsyncState<T, E>,
    resource: Resource<AsyncState<T, E>, E>,
}

impl<T: 'static, E: 'static> TrackedFunction<T, E> {
    fn from_state(owner: &Destroyable, state: AsyncState<T, E>) -> Self {
        let shared = Rc::new(state.clone());
        let resource = Resource::from_produced(owner, move |cx| {
            shared.retry(cx.sc())?;
            Ok(Produced::Shared(shared.clone()))
        });
        resource.destroyable().associate_child(state.destroyable());
        Self { state, resource }
    }

    /// Brings the function up to date and returns the result of its latest future.
    ///
    /// Returns an error if the function failed before returning a future.
    pub fn result(&self, sc: &mut SignalContext) -> Result<AsyncResult<T, E>, ResourceError<E>> {
        let state = self.resource.current(sc)?;
        Ok(state.result(sc))
    }

    /// Brings the function up to date and returns the status of its latest future.
    ///
    /// A failure before the future is returned leaves the status unchanged.
    pub fn status(&self, sc: &mut SignalContext) -> AsyncStatus {
        let _ = self.resource.current(sc);
        self.state.status(sc)
    }
    pub fn value(&self, sc: &mut SignalContext) -> Option<Rc<T>> {
        let _ = self.resource.current(sc);
        self.state.value(sc)
    }

    /// Calls the function again even if none of its dependencies changed.
    pub fn retry(&self, sc: &mut SignalContext) -> Result<(), E> {
        self.state.retry(sc)
    }

    pub fn state(&self) -> &AsyncState<T, E> {
        &self.state
    }
    pub fn destroy(&self) {
        self.resource.destroy()
    }
    pub fn is_destroyed(&self) -> bool {
        self.resource.is_destroyed()
    }
}

impl<T: 'static, E: 'static> std::fmt::Debug for TrackedFunction<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedFunction")
            .field("state", &self.state)
            .field("resource", &self.resource)
            .finish()
    }
}
