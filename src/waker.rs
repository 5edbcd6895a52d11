//! Wakers that re-arm a ready source.
//!
//! Waking a task never polls it directly: it marks the task's source ready
//! on the main context, and the task is polled the next time the context
//! dispatches the high priority tier. This works from any thread.

use std::sync::Arc;
use std::task::Waker;

use futures::task::ArcWake;

use crate::native::{MainContext, SourceId};

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

struct SourceWaker {
    context: MainContext,
    source: SourceId,
}

impl ArcWake for SourceWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        // A destroyed source means the task already finished.
        arc_self.context.set_ready(arc_self.source);
    }
}

/// Build a waker that arms `source` on `context`.
pub(crate) fn source_waker(context: &MainContext, source: SourceId) -> Waker {
    futures::task::waker(Arc::new(SourceWaker {
        context: context.clone(),
        source,
    }))
}
