use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size work-sharing pool.
///
/// Jobs are dispatched over a bounded MPMC channel; idle workers block on the
/// channel and the pool drains fully on [`WorkerPool::join`]. Workers may
/// submit further jobs (recursive discovery), which is why the channel is
/// bounded generously rather than rendezvous.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let (tx, rx): (Sender<Job>, Receiver<Job>) = crossbeam_channel::bounded(num_workers * 64);
        let active = Arc::new(AtomicUsize::new(0));

        let workers = (0..num_workers)
            .map(|_| {
                let rx = rx.clone();
                let active = Arc::clone(&active);
                std::thread::spawn(move || {
                    for job in rx.iter() {
                        active.fetch_add(1, Ordering::SeqCst);
                        job();
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
            active,
        }
    }

    /// Number of workers currently executing a job.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Submit a job. Blocks when the queue is full, providing backpressure.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            // Send only fails when all receivers are gone, i.e. after join.
            let _ = tx.send(Box::new(job));
        }
    }

    /// Close the queue and wait for all submitted jobs to finish.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn runs_all_jobs() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn zero_workers_clamps_to_one() {
        let pool = WorkerPool::new(0);
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(7, Ordering::SeqCst);
        });
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn drop_without_join_drains_queue() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let pool = WorkerPool::new(2);
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
