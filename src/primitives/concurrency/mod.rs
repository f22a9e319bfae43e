#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

/// Counts in-flight lookups and writes and lets the compactor close the door
/// on new ones while it waits for the current ones to drain.
#[derive(Clone, Default)]
pub struct LeaseBarrier {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BarrierState>,
    changed: Condvar,
}

#[derive(Default, Debug)]
struct BarrierState {
    active: u32,
    closed: bool,
}

/// Snapshot of barrier state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BarrierSnapshot {
    /// Leases currently held.
    pub active: u32,
    /// Whether new leases are blocked.
    pub closed: bool,
}

/// Held by every lookup and write for the duration of the call.
pub struct Lease {
    inner: Arc<Inner>,
}

/// Exclusive window: no lease is held and none can be acquired until the
/// gate is dropped.
pub struct Gate {
    inner: Arc<Inner>,
}

impl LeaseBarrier {
    /// Creates an open barrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a lease, waiting while the barrier is closed.
    pub fn acquire(&self) -> Lease {
        let mut state = self.inner.state.lock();
        while state.closed {
            self.inner.changed.wait(&mut state);
        }
        state.active += 1;
        Lease {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Closes the barrier and waits up to `timeout` for active leases to
    /// drain. On timeout the barrier is reopened and `None` is returned.
    pub fn close(&self, timeout: Duration) -> Option<Gate> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        // Only one gate at a time.
        while state.closed {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
        state.closed = true;
        while state.active > 0 {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() && state.active > 0
            {
                state.closed = false;
                drop(state);
                self.inner.changed.notify_all();
                return None;
            }
        }
        Some(Gate {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Closes the barrier, waiting as long as it takes.
    pub fn close_blocking(&self) -> Gate {
        let mut state = self.inner.state.lock();
        while state.closed {
            self.inner.changed.wait(&mut state);
        }
        state.closed = true;
        while state.active > 0 {
            self.inner.changed.wait(&mut state);
        }
        Gate {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns a snapshot of the current state.
    pub fn snapshot(&self) -> BarrierSnapshot {
        let state = self.inner.state.lock();
        BarrierSnapshot {
            active: state.active,
            closed: state.closed,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.active = state.active.saturating_sub(1);
        let drained = state.active == 0;
        drop(state);
        if drained {
            self.inner.changed.notify_all();
        }
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        self.inner.state.lock().closed = false;
        self.inner.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn leases_are_counted() {
        let barrier = LeaseBarrier::new();
        let a = barrier.acquire();
        let b = barrier.acquire();
        assert_eq!(barrier.snapshot().active, 2);
        drop(a);
        drop(b);
        assert_eq!(barrier.snapshot(), BarrierSnapshot::default());
    }

    #[test]
    fn close_times_out_while_lease_held_and_reopens() {
        let barrier = LeaseBarrier::new();
        let lease = barrier.acquire();
        assert!(barrier.close(Duration::from_millis(20)).is_none());
        assert!(!barrier.snapshot().closed);
        drop(lease);
        let gate = barrier.close(Duration::from_millis(20)).expect("drained");
        assert!(barrier.snapshot().closed);
        drop(gate);
        let _lease = barrier.acquire();
        assert_eq!(
            barrier.snapshot(),
            BarrierSnapshot {
                active: 1,
                closed: false
            }
        );
    }

    #[test]
    fn gate_blocks_new_leases_until_dropped() {
        let barrier = LeaseBarrier::new();
        let gate = barrier.close_blocking();
        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let barrier = barrier.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _lease = barrier.acquire();
                acquired.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(gate);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn close_waits_for_lease_released_on_other_thread() {
        let barrier = LeaseBarrier::new();
        let lease = barrier.acquire();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(lease);
        });
        let gate = barrier.close(Duration::from_secs(5));
        assert!(gate.is_some());
        handle.join().unwrap();
    }
}
