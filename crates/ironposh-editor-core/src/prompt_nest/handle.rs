use std::fmt;
use std::pin::pin;
use std::sync::Arc;

use futures::future::{Either, select};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::EditorServicesError;
use crate::engine::Runspace;

/// Single-slot FIFO queue of the right to use a frame's pipeline.
///
/// Waiters are served in arrival order; a closed queue fails its waiters.
#[derive(Debug, Clone)]
pub(crate) struct HandleQueue {
    slot: Arc<Semaphore>,
}

impl HandleQueue {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub(crate) async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, EditorServicesError> {
        if cancel.is_cancelled() {
            return Err(EditorServicesError::Cancelled);
        }

        let acquire = pin!(Arc::clone(&self.slot).acquire_owned());
        let cancelled = pin!(cancel.cancelled());

        match select(acquire, cancelled).await {
            Either::Left((Ok(permit), _)) => Ok(permit),
            Either::Left((Err(_), _)) => Err(EditorServicesError::FrameExited),
            Either::Right(((), _)) => Err(EditorServicesError::Cancelled),
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    pub(crate) fn close(&self) {
        self.slot.close();
    }
}

/// Exclusive lease on the current runspace for the duration of one execution.
///
/// Released exactly once, either through [`RunspaceHandle::release`] or on
/// drop. A read-line handle of an in-process runspace also holds the main
/// handle of the frame it was taken in.
pub struct RunspaceHandle {
    runspace: Arc<dyn Runspace>,
    is_read_line: bool,
    main: Option<OwnedSemaphorePermit>,
    read_line: Option<OwnedSemaphorePermit>,
}

impl RunspaceHandle {
    pub(crate) fn new(
        runspace: Arc<dyn Runspace>,
        is_read_line: bool,
        main: Option<OwnedSemaphorePermit>,
        read_line: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            runspace,
            is_read_line,
            main,
            read_line,
        }
    }

    pub fn runspace(&self) -> &Arc<dyn Runspace> {
        &self.runspace
    }

    pub fn is_read_line_context(&self) -> bool {
        self.is_read_line
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RunspaceHandle {
    fn drop(&mut self) {
        trace!(
            target: "prompt_nest",
            is_read_line = self.is_read_line,
            held_main = self.main.is_some(),
            held_read_line = self.read_line.is_some(),
            "releasing runspace handle"
        );
        // Read-line slot first so a waiter on the main slot never observes
        // the read-line frame as still busy.
        self.read_line.take();
        self.main.take();
    }
}

impl fmt::Debug for RunspaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunspaceHandle")
            .field("instance_id", &self.runspace.instance_id())
            .field("is_read_line", &self.is_read_line)
            .finish_non_exhaustive()
    }
}
