//! Single-worker execution pool
//!
//! Every executor variant owns at most one worker, so calls into a given
//! service instance are strictly serialized: plugin instances are assumed
//! stateful and not thread-safe. The worker owns its state outright; jobs
//! are closures shipped over a channel and run in FIFO admission order.

use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("worker thread is gone")]
pub struct WorkerGone;

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// A dedicated thread owning one value of type `S`, executing jobs against
/// it in submission order
pub(crate) struct Worker<S: Send + 'static> {
    tx: Option<Sender<Job<S>>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> Worker<S> {
    pub fn spawn(name: &str, mut state: S) -> io::Result<Self> {
        let (tx, rx) = unbounded::<Job<S>>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            for job in rx.iter() {
                job(&mut state);
            }
        })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Enqueue a job; never blocks beyond the channel send
    pub fn execute(&self, job: impl FnOnce(&mut S) + Send + 'static) -> Result<(), WorkerGone> {
        self.tx
            .as_ref()
            .ok_or(WorkerGone)?
            .send(Box::new(job))
            .map_err(|_| WorkerGone)
    }
}

impl<S: Send + 'static> Drop for Worker<S> {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain remaining jobs and exit.
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_in_submission_order() {
        let worker = Worker::spawn("test-worker", Vec::<usize>::new()).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..16 {
            let seen = Arc::clone(&seen);
            worker
                .execute(move |log| {
                    log.push(i);
                    seen.lock().push(i);
                })
                .unwrap();
        }
        drop(worker); // joins after draining

        assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn drop_waits_for_queued_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn("test-worker", ()).unwrap();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            worker
                .execute(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        drop(worker);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
