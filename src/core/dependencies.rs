use std::{cell::RefCell, rc::Rc};

use crate::SignalContext;

use super::{BindSink, DirtyOrMaybeDirty, NotifyContext, Slot, SourceBinder};

/// The set of sources read by a call to [`Runtime::run_tracked`](super::Runtime::run_tracked).
///
/// The set stays subscribed to its sources until it is dropped, so [`is_stale`](Self::is_stale)
/// reports whether any of them has changed since the tracked call.
#[derive(Clone)]
pub struct Dependencies(Rc<DependenciesNode>);

struct DependenciesNode {
    sb: RefCell<SourceBinder>,
}

impl Dependencies {
    pub(crate) fn new() -> Self {
        Self(Rc::new_cyclic(|this| DependenciesNode {
            sb: RefCell::new(SourceBinder::new(this, Slot(0))),
        }))
    }
    pub(crate) fn track<T>(
        &self,
        sc: &mut SignalContext,
        f: impl FnOnce(&mut SignalContext) -> T,
    ) -> T {
        self.0.sb.borrow_mut().update(f, sc.uc())
    }

    /// Returns `true` if a source read during the tracked call has changed.
    ///
    /// Derived sources such as [`Resource`](crate::Resource) are brought up to date to find out.
    pub fn is_stale(&self, sc: &mut SignalContext) -> bool {
        let mut sb = self.0.sb.borrow_mut();
        !sb.is_clean() && sb.check(sc.uc())
    }

    /// Number of distinct reads recorded.
    pub fn len(&self) -> usize {
        self.0.sb.borrow().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BindSink for DependenciesNode {
    fn notify(self: Rc<Self>, slot: Slot, dirty: DirtyOrMaybeDirty, _nc: &mut NotifyContext) {
        self.sb.borrow_mut().on_notify(slot, dirty);
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("len", &self.len())
            .finish()
    }
}
