//! A FIFO gate bounding the number of concurrent fetches.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use oneshot_fused_workaround as oneshot;

/// Bounds concurrent requests; excess callers queue in arrival order.
///
/// A waiter that gives up (drops its future) simply never receives the
/// permit; release skips dead waiters when handing permits on.
#[derive(Debug)]
pub struct InflightGate {
    /// Count of free permits plus the waiter queue.
    state: Mutex<GateState>,
}

/// Mutable gate internals.
#[derive(Debug)]
struct GateState {
    /// Number of permits not currently held.
    available: usize,
    /// Callers waiting for a permit, oldest first.
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl InflightGate {
    /// Construct a gate with `permits` concurrent slots.
    ///
    /// Zero is treated as one.
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(InflightGate {
            state: Mutex::new(GateState {
                available: permits.max(1),
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Wait for a permit.
    pub async fn acquire(self: &Arc<Self>) -> Permit {
        loop {
            let rx = {
                let mut state = self.state.lock().expect("poisoned gate lock");
                if state.available > 0 {
                    state.available -= 1;
                    return Permit {
                        gate: Arc::clone(self),
                    };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };
            // If the gate was dropped while we waited, just retry; the
            // next lock either finds a permit or re-queues us.
            if rx.await.is_ok() {
                return Permit {
                    gate: Arc::clone(self),
                };
            }
        }
    }

    /// Hand a freed permit to the oldest live waiter, or bank it.
    fn release(&self) {
        let mut state = self.state.lock().expect("poisoned gate lock");
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                // Ownership of the permit moved to the waiter.
                return;
            }
            // That waiter went away; try the next.
        }
        state.available += 1;
    }

    /// Number of permits currently free (for tests and health output).
    pub fn available(&self) -> usize {
        self.state.lock().expect("poisoned gate lock").available
    }
}

/// Held while a request is in flight; dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    /// The gate this permit came from.
    gate: Arc<InflightGate>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn counts_permits() {
        let gate = InflightGate::new(2);
        let p1 = futures::executor::block_on(gate.acquire());
        assert_eq!(gate.available(), 1);
        let p2 = futures::executor::block_on(gate.acquire());
        assert_eq!(gate.available(), 0);
        drop(p1);
        assert_eq!(gate.available(), 1);
        drop(p2);
        assert_eq!(gate.available(), 2);
    }

    #[test]
    fn fifo_order() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let gate = InflightGate::new(1);
        let order = Rc::new(RefCell::new(Vec::new()));

        let first = futures::executor::block_on(gate.acquire());

        for n in 0..3 {
            let gate = Arc::clone(&gate);
            let order = Rc::clone(&order);
            spawner
                .spawn_local(async move {
                    let _permit = gate.acquire().await;
                    order.borrow_mut().push(n);
                })
                .unwrap();
        }
        // Everyone queues behind `first`.
        pool.run_until_stalled();
        assert!(order.borrow().is_empty());

        drop(first);
        pool.run_until_stalled();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn cancelled_waiter_is_skipped() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let gate = InflightGate::new(1);
        let first = futures::executor::block_on(gate.acquire());

        // A waiter that gives up: build the future, poll it once, drop it.
        {
            let gate = Arc::clone(&gate);
            let handle = spawner
                .spawn_local_with_handle(async move {
                    let _permit = gate.acquire().await;
                })
                .unwrap();
            pool.run_until_stalled();
            drop(handle); // cancels the queued waiter
        }

        let got = Rc::new(RefCell::new(false));
        {
            let gate = Arc::clone(&gate);
            let got = Rc::clone(&got);
            spawner
                .spawn_local(async move {
                    let _permit = gate.acquire().await;
                    *got.borrow_mut() = true;
                })
                .unwrap();
        }
        pool.run_until_stalled();
        drop(first);
        pool.run_until_stalled();
        assert!(*got.borrow());
        drop(got);
        assert_eq!(gate.available(), 1);
    }
}
