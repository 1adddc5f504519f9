//! Clocks and the deferred task queue
//!
//! Deferred work is kept in a deadline-ordered queue and run by whoever
//! drives the engine. Every entry holds a child of the queue's root
//! cancellation token: cancelling the root (engine close) voids everything
//! already scheduled and refuses anything new.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

// =============================================================================
// Clocks
// =============================================================================

/// Millisecond wall clock
pub trait Clock: Send {
    fn now(&self) -> u64;
}

/// Real time via chrono
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Manually advanced clock; clones share the same time
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Timer Queue
// =============================================================================

#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: BTreeMap<(u64, u64), (T, CancellationToken)>,
    seq: u64,
    root: CancellationToken,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            seq: 0,
            root: CancellationToken::new(),
        }
    }

    /// Schedule `task` at `deadline`. Returns its token, or `None` once closed.
    pub fn schedule(&mut self, deadline: u64, task: T) -> Option<CancellationToken> {
        let token = self.root.child_token();
        self.schedule_with(deadline, task, token)
    }

    /// Schedule under an existing token so a group of tasks can be cancelled together
    pub fn schedule_with(
        &mut self,
        deadline: u64,
        task: T,
        token: CancellationToken,
    ) -> Option<CancellationToken> {
        if self.root.is_cancelled() || token.is_cancelled() {
            return None;
        }
        self.seq += 1;
        self.entries
            .insert((deadline, self.seq), (task, token.clone()));
        Some(token)
    }

    /// A fresh child of the root token
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop the next live task due at `now`, discarding cancelled ones
    pub fn pop_due(&mut self, now: u64) -> Option<T> {
        loop {
            let key = *self.entries.keys().next()?;
            if key.0 > now {
                return None;
            }
            if let Some((task, token)) = self.entries.remove(&key) {
                if !token.is_cancelled() {
                    return Some(task);
                }
            }
        }
    }

    /// Cancel everything, now and in the future
    pub fn close(&mut self) {
        self.root.cancel();
        self.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
