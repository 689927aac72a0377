/*!
 * Serial Work Queue
 *
 * A single named worker thread draining a FIFO of boxed jobs. Dispatch never
 * blocks the caller; `drain` closes the queue, runs whatever is still queued
 * and joins the worker. A panicking job is logged and the worker moves on to
 * the next one.
 *
 * The channel is Tokio's unbounded mpsc so producers may be plain threads,
 * foreign callback threads, or async tasks alike.
 */

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct SerialQueue {
    label: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialQueue {
    /// Spawn the worker thread
    pub fn new(label: &str) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let worker_label = label.to_string();
        let worker = std::thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Serial queue {} job panicked, continuing", worker_label);
                    }
                }
            })?;

        debug!("Serial queue {} started", label);

        Ok(Self {
            label: label.to_string(),
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue a job. Returns false if the queue has already been drained.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match guard.as_ref() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => {
                debug!("Serial queue {} closed, job discarded", self.label);
                false
            }
        }
    }

    /// Close the queue, run every job still queued, and join the worker.
    ///
    /// Idempotent. Called from a job on this queue it only closes the queue:
    /// the remaining jobs run after the current one returns, and nobody waits
    /// for them.
    pub fn drain(&self) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);

        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(worker) = worker {
            if worker.thread().id() == std::thread::current().id() {
                debug!("Serial queue {} closed from its own worker", self.label);
                return;
            }
            if worker.join().is_err() {
                error!("Serial queue {} worker panicked", self.label);
            }
            debug!("Serial queue {} drained", self.label);
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_fifo_order() {
        let queue = SerialQueue::new("test.fifo").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            assert!(queue.dispatch(move || seen.lock().unwrap().push(i)));
        }
        queue.drain();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_waits_for_slow_jobs() {
        let queue = SerialQueue::new("test.slow").unwrap();
        let done = Arc::new(Mutex::new(0));

        for _ in 0..3 {
            let done = done.clone();
            queue.dispatch(move || {
                std::thread::sleep(Duration::from_millis(20));
                *done.lock().unwrap() += 1;
            });
        }
        queue.drain();

        assert_eq!(*done.lock().unwrap(), 3);
    }

    #[test]
    fn test_dispatch_after_drain_is_rejected() {
        let queue = SerialQueue::new("test.closed").unwrap();
        queue.drain();
        queue.drain();
        assert!(!queue.dispatch(|| panic!("must not run")));
    }

    #[test]
    fn test_panicking_job_does_not_stop_queue() {
        let queue = SerialQueue::new("test.panic").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8 {
            let seen = seen.clone();
            assert!(queue.dispatch(move || {
                if i == 1 {
                    panic!("job {} failed", i);
                }
                seen.lock().unwrap().push(i);
            }));
        }
        queue.drain();

        assert_eq!(*seen.lock().unwrap(), vec![0, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_drain_from_own_job_does_not_deadlock() {
        let queue = Arc::new(SerialQueue::new("test.self").unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let inner = queue.clone();
        let slot = seen.clone();
        queue.dispatch(move || {
            go_rx.recv().unwrap();
            inner.drain();
            slot.lock().unwrap().push("drained");
        });
        let slot = seen.clone();
        queue.dispatch(move || {
            slot.lock().unwrap().push("after");
            done_tx.send(()).unwrap();
        });
        go_tx.send(()).unwrap();

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["drained", "after"]);
        assert!(!queue.dispatch(|| {}));
        queue.drain();
    }

    #[test]
    fn test_worker_thread_is_named() {
        let queue = SerialQueue::new("test.named").unwrap();
        let name = Arc::new(Mutex::new(None));
        let slot = name.clone();
        queue.dispatch(move || {
            *slot.lock().unwrap() = std::thread::current().name().map(str::to_string);
        });
        queue.drain();
        assert_eq!(name.lock().unwrap().as_deref(), Some("test.named"));
    }
}
