//! Reactive resources: values derived from functions whose lifecycle follows both the
//! values they read and the owner they belong to.
//!
//! - [`Destroyable`] is a node of the ownership graph. Destroying it destroys its children.
//! - [`State`] is a reactive cell. Reads through a tracking [`SignalContext`] are recorded.
//! - [`Resource`] re-runs its function when a recorded read changes, after running the
//!   cleanups of the previous run.
//! - [`ResourceFactory`] reuses resources across calls from the same call site.
//! - [`AsyncState`] and [`TrackedFunction`] track the latest of a series of futures.
//! - [`ClassResource`] drives an object through `setup`, `update` and `teardown`.
//!
//! All of it is single-threaded and driven by a [`Runtime`].

pub mod core;

mod async_state;
mod class;
mod destroy;
mod error;
mod factory;
mod resource;
mod state;
mod tracked_function;

#[cfg(test)]
mod test_helpers;

pub use async_state::{AsyncResult, AsyncState, AsyncStatus};
pub use class::{ClassPhase, ClassResource, Lifecycle, Update};
pub use self::core::{
    spawn_action, spawn_action_async, ActionContext, AsyncActionContext, CyclicError,
    Dependencies, Runtime, SignalContext, UpdateContext,
};
pub use destroy::{DestroyPhase, Destroyable, DestroyableId, DestructorKey};
pub use error::{InvalidCleanupRegistration, ResourceError};
pub use factory::{resource_factory, try_resource_factory, ResourceFactory, ShallowEq};
pub use resource::{Hooks, Produced, Resource, ResourceContext};
pub use state::{State, StateRefMut};
pub use tracked_function::{tracked_function, try_tracked_function, TrackedFunction};
