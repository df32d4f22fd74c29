//! Timer scheduler shared by all recurring queries of an engine.
//!
//! One service thread sleeps on a monotonic min-heap of deadlines and runs
//! due tasks outside of the scheduler lock. Cancellation is lazy, a
//! cancelled entry stays in the heap until its deadline and is skipped when
//! it surfaces.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Identifies a scheduled entry for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerToken(u64);

pub(crate) struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct Entry {
    deadline: Instant,
    id: u64,
    task: Box<dyn FnOnce() + Send>,
}

// The heap is a max-heap, order entries by reversed deadline so the
// earliest deadline surfaces first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entry {}

impl Scheduler {
    pub(crate) fn start() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();

        // The service thread exits on its own once shutdown is flagged, it
        // is intentionally not joined so that the flag may be set from one
        // of its own tasks
        if let Err(e) = thread::Builder::new()
            .name("dns-sched".into())
            .spawn(move || service(thread_shared))
        {
            log::error!("Failed to start DNS scheduler thread: {e}");
        }

        Self { shared }
    }

    /// Run `task` after `delay`.
    pub(crate) fn schedule(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> TimerToken {
        let mut state = self.shared.state.lock();

        let id = state.next_id;
        state.next_id += 1;

        state.heap.push(Entry {
            deadline: Instant::now() + delay,
            id,
            task: Box::new(task),
        });

        self.shared.cond.notify_one();

        TimerToken(id)
    }

    /// Delete a pending entry. Returns whether the entry had not fired yet.
    pub(crate) fn cancel(&self, token: TimerToken) -> bool {
        let mut state = self.shared.state.lock();

        if state.heap.iter().any(|entry| entry.id == token.0) {
            state.cancelled.insert(token.0);
            self.shared.cond.notify_one();
            true
        } else {
            false
        }
    }

    pub(crate) fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_one();
    }
}

fn service(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();

            loop {
                if state.shutdown {
                    return;
                }

                let Some(entry) = state.heap.peek() else {
                    shared.cond.wait(&mut state);
                    continue;
                };

                let deadline = entry.deadline;

                if deadline <= Instant::now() {
                    let entry = state.heap.pop().unwrap();

                    if state.cancelled.remove(&entry.id) {
                        continue;
                    }

                    break entry.task;
                }

                let _ = shared.cond.wait_until(&mut state, deadline);
            }
        };

        // No scheduler lock held while a task runs
        task();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;

    #[test]
    fn fires_in_deadline_order() {
        let sched = Scheduler::start();
        let (tx, rx) = mpsc::channel();

        let tx2 = tx.clone();
        sched.schedule(Duration::from_millis(120), move || tx2.send(2).unwrap());
        sched.schedule(Duration::from_millis(40), move || tx.send(1).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);

        sched.shutdown();
    }

    #[test]
    fn cancelled_entries_do_not_fire() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        let sched = Scheduler::start();

        let token = sched.schedule(Duration::from_millis(50), || {
            FIRED.fetch_add(1, AtomicOrdering::SeqCst);
        });

        assert!(sched.cancel(token));
        assert!(!sched.cancel(token));

        thread::sleep(Duration::from_millis(150));
        assert_eq!(FIRED.load(AtomicOrdering::SeqCst), 0);

        sched.shutdown();
    }
}
