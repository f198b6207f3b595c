use parse_display::Display;

/// Error returned when reading a [`Resource`](crate::Resource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError<E> {
    /// The resource function failed. No value was cached.
    Evaluation(E),
    /// The resource has been destroyed.
    Destroyed,
}

impl<E> ResourceError<E> {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, ResourceError::Destroyed)
    }
}

impl<E: std::fmt::Display> std::fmt::Display for ResourceError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceError::Evaluation(e) => write!(f, "resource function failed: {e}"),
            ResourceError::Destroyed => write!(f, "resource has been destroyed"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResourceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResourceError::Evaluation(e) => Some(e),
            ResourceError::Destroyed => None,
        }
    }
}

/// `on_cleanup` was called outside of an active evaluation of the resource function.
#[non_exhaustive]
#[derive(Display, Debug, Clone, PartialEq, Eq)]
#[display("`on_cleanup` called outside of an active resource evaluation")]
pub struct InvalidCleanupRegistration {}

impl std::error::Error for InvalidCleanupRegistration {}
