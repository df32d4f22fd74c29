//! The task queue owning the thread resolver callbacks run on.
//!
//! The DNS engine completes queries on backend threads. User callbacks must
//! never run there, so every completion is posted here and drained by one
//! dedicated thread owned by the SIP layer.

use std::io;
use std::sync::mpsc;
use std::thread;

type Task = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub(crate) struct TaskQueue {
    tx: mpsc::Sender<Task>,
}

impl TaskQueue {
    pub(crate) fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();

        // The thread exits once every queue handle is gone
        thread::Builder::new()
            .name("sip-resolve".into())
            .spawn(move || {
                for task in rx {
                    task();
                }
            })?;

        Ok(Self { tx })
    }

    pub(crate) fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(task)).is_err() {
            log::error!("SIP resolver task queue is shut down, dropping task");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tasks_run_in_post_order_off_thread() {
        let queue = TaskQueue::spawn().unwrap();
        let (tx, rx) = mpsc::channel();

        let caller = thread::current().id();

        for i in 0..3 {
            let tx = tx.clone();
            queue.post(move || {
                tx.send((i, thread::current().id())).unwrap();
            });
        }

        for expected in 0..3 {
            let (i, thread_id) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(i, expected);
            assert_ne!(thread_id, caller);
        }
    }
}
