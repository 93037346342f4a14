//! Per-category lazy initialization state.
//!
//! Every category of a proxy context owns one [`CategoryCell`] with its own
//! lock, so a stalled category never blocks an unrelated one.
//!
//! ```text
//! Uninitialized ──begin()──► Initializing ──complete()──► Initialized
//!       ▲                         │
//!       └──── guard dropped ──────┘        clear(): any state ─► Uninitialized
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Metadata categories of a remote context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Info,
    Children,
    Variables,
    Functions,
    Events,
    Actions,
    Status,
    VisibleChildren,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Info,
        Category::Children,
        Category::Variables,
        Category::Functions,
        Category::Events,
        Category::Actions,
        Category::Status,
        Category::VisibleChildren,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Info => "info",
            Category::Children => "children",
            Category::Variables => "variables",
            Category::Functions => "functions",
            Category::Events => "events",
            Category::Actions => "actions",
            Category::Status => "status",
            Category::VisibleChildren => "visible children",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryState {
    Uninitialized,
    Initializing,
    Initialized,
}

struct Inner {
    state: CategoryState,
    /// Bumped by `clear`; an initialization started under an older epoch
    /// cannot complete.
    epoch: u64,
}

pub(crate) enum Begin<'a> {
    AlreadyInitialized,
    InProgress,
    Started(InitGuard<'a>),
}

pub(crate) struct CategoryCell {
    inner: Mutex<Inner>,
    settled: Notify,
}

impl CategoryCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CategoryState::Uninitialized,
                epoch: 0,
            }),
            settled: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> CategoryState {
        self.inner.lock().state
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state() == CategoryState::Initialized
    }

    /// Claim the initialization. Never waits.
    pub(crate) fn begin(&self) -> Begin<'_> {
        let mut inner = self.inner.lock();
        match inner.state {
            CategoryState::Initialized => Begin::AlreadyInitialized,
            CategoryState::Initializing => Begin::InProgress,
            CategoryState::Uninitialized => {
                inner.state = CategoryState::Initializing;
                Begin::Started(InitGuard {
                    cell: self,
                    epoch: inner.epoch,
                    finished: false,
                })
            }
        }
    }

    /// Forget the initialized state, including one in progress.
    pub(crate) fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = CategoryState::Uninitialized;
            inner.epoch += 1;
        }
        self.settled.notify_waiters();
    }

    /// Wait until no initialization is in progress.
    pub(crate) async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() != CategoryState::Initializing {
                return;
            }
            notified.await;
        }
    }

    /// [`wait_settled`](Self::wait_settled) bounded by `timeout`; false on timeout.
    pub(crate) async fn wait_settled_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_settled())
            .await
            .is_ok()
    }
}

/// Ownership of an in-progress initialization. Dropping it without
/// [`complete`](Self::complete) reverts the category to uninitialized.
pub(crate) struct InitGuard<'a> {
    cell: &'a CategoryCell,
    epoch: u64,
    finished: bool,
}

impl InitGuard<'_> {
    /// Mark the category initialized. Returns false when it was cleared in
    /// the meantime.
    pub(crate) fn complete(mut self) -> bool {
        self.finished = true;
        let completed = {
            let mut inner = self.cell.inner.lock();
            if inner.epoch == self.epoch && inner.state == CategoryState::Initializing {
                inner.state = CategoryState::Initialized;
                true
            } else {
                false
            }
        };
        self.cell.settled.notify_waiters();
        completed
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        {
            let mut inner = self.cell.inner.lock();
            if inner.epoch == self.epoch && inner.state == CategoryState::Initializing {
                inner.state = CategoryState::Uninitialized;
            }
        }
        self.cell.settled.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_begin_complete() {
        let cell = CategoryCell::new();
        let guard = match cell.begin() {
            Begin::Started(g) => g,
            _ => panic!("expected to start"),
        };
        assert!(matches!(cell.begin(), Begin::InProgress));
        assert!(guard.complete());
        assert!(matches!(cell.begin(), Begin::AlreadyInitialized));
    }

    #[test]
    fn test_dropped_guard_reverts() {
        let cell = CategoryCell::new();
        match cell.begin() {
            Begin::Started(g) => drop(g),
            _ => panic!("expected to start"),
        }
        assert_eq!(cell.state(), CategoryState::Uninitialized);
    }

    #[test]
    fn test_clear_during_init_blocks_completion() {
        let cell = CategoryCell::new();
        let stale = match cell.begin() {
            Begin::Started(g) => g,
            _ => panic!("expected to start"),
        };
        cell.clear();

        let fresh = match cell.begin() {
            Begin::Started(g) => g,
            _ => panic!("expected to restart"),
        };
        assert!(!stale.complete());
        assert_eq!(cell.state(), CategoryState::Initializing);
        assert!(fresh.complete());
        assert!(cell.is_initialized());
    }

    #[tokio::test]
    async fn test_wait_settled_wakes_on_completion() {
        let cell = Arc::new(CategoryCell::new());
        let guard = match cell.begin() {
            Begin::Started(g) => g,
            _ => panic!("expected to start"),
        };

        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_settled_for(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(guard.complete());
        let settled = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(settled);
        assert!(cell.is_initialized());
    }

    #[tokio::test]
    async fn test_wait_settled_times_out() {
        let cell = CategoryCell::new();
        let _guard = match cell.begin() {
            Begin::Started(g) => g,
            _ => panic!("expected to start"),
        };
        assert!(!cell.wait_settled_for(Duration::from_millis(20)).await);
    }
}
