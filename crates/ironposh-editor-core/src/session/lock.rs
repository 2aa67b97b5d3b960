use std::pin::pin;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Default)]
struct Holders {
    /// Prompt nesting level of every execution currently holding the lock
    levels: Vec<usize>,
    aborting: bool,
}

/// Guards session-state transitions made by command execution against abort.
///
/// Reentrant along one call chain: an execution running in a nested frame
/// (debugger stop, nested prompt, idle event) may acquire while executions of
/// enclosing frames hold it. Executions at the same or a deeper level wait.
/// Abort only ever try-acquires, and only when nothing holds the lock.
#[derive(Debug, Default)]
pub struct SessionStateLock {
    holders: Mutex<Holders>,
    released: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Execute(usize),
    Abort,
}

#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct SessionStateGuard<'a> {
    lock: &'a SessionStateLock,
    hold: Hold,
}

impl SessionStateLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire_for_execute_command(&self, level: usize) -> SessionStateGuard<'_> {
        loop {
            let mut notified = pin!(self.released.notified());
            notified.as_mut().enable();

            if let Some(guard) = self.try_acquire_for_execute_command(level) {
                return guard;
            }

            trace!(target: "session", level, "waiting for session state lock");
            notified.await;
        }
    }

    pub fn try_acquire_for_execute_command(&self, level: usize) -> Option<SessionStateGuard<'_>> {
        let mut holders = self.holders.lock().expect("session state lock mutex poisoned");
        if holders.aborting || holders.levels.iter().any(|held| *held >= level) {
            return None;
        }

        holders.levels.push(level);
        Some(SessionStateGuard {
            lock: self,
            hold: Hold::Execute(level),
        })
    }

    pub fn try_acquire_for_debugger_abort(&self) -> Option<SessionStateGuard<'_>> {
        let mut holders = self.holders.lock().expect("session state lock mutex poisoned");
        if holders.aborting || !holders.levels.is_empty() {
            return None;
        }

        holders.aborting = true;
        Some(SessionStateGuard {
            lock: self,
            hold: Hold::Abort,
        })
    }

    pub fn holder_count(&self) -> usize {
        let holders = self.holders.lock().expect("session state lock mutex poisoned");
        holders.levels.len() + usize::from(holders.aborting)
    }

    fn release(&self, hold: Hold) {
        {
            let mut holders = self.holders.lock().expect("session state lock mutex poisoned");
            match hold {
                Hold::Execute(level) => {
                    if let Some(index) = holders.levels.iter().rposition(|held| *held == level) {
                        holders.levels.swap_remove(index);
                    }
                }
                Hold::Abort => holders.aborting = false,
            }
        }
        self.released.notify_waiters();
    }
}

impl Drop for SessionStateGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.hold);
    }
}
