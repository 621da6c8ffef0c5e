// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A bounded pool of workers processing inbound messages.
//!
//! Each worker drains its own queue, and jobs are assigned to a worker by
//! key.  Connection handlers key their jobs by connection, so messages from
//! one peer are processed in the order they arrived.

use parking_lot::Mutex;
use slog::debug;
use tokio::sync::mpsc;

use crate::types::*;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    log: slog::Logger,
    queues: Vec<mpsc::Sender<Job>>,
    // Held until the workers are started.
    pending: Mutex<Option<Vec<mpsc::Receiver<Job>>>>,
}

impl WorkerPool {
    /// `depth` is shared among the workers, with at least one slot each.
    pub fn new(log: &slog::Logger, workers: usize, depth: usize) -> Self {
        let workers = workers.max(1);
        let per_worker = (depth / workers).max(1);
        let (queues, receivers) =
            (0..workers).map(|_| mpsc::channel(per_worker)).unzip();
        WorkerPool {
            log: log.new(slog::o!("unit" => "worker_pool")),
            queues,
            pending: Mutex::new(Some(receivers)),
        }
    }

    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Spawn the worker tasks.  Calls after the first do nothing.
    pub fn start(&self) {
        let Some(receivers) = self.pending.lock().take() else {
            return;
        };
        for (id, mut rx) in receivers.into_iter().enumerate() {
            let log = self.log.new(slog::o!("worker" => id));
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job();
                }
                debug!(log, "worker exiting");
            });
        }
    }

    /// Queue a job behind earlier jobs with the same key.
    pub fn submit(&self, key: u64, job: Job) -> OvxResult<()> {
        let idx = (key % self.queues.len() as u64) as usize;
        self.queues[idx].try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OvxError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                OvxError::Other("worker pool has shut down".to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_with_one_key_run_in_order() {
        let pool = WorkerPool::new(&test_log(), 4, 64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        pool.start();
        for i in 0..10 {
            let seen = seen.clone();
            let done = done_tx.clone();
            pool.submit(
                3,
                Box::new(move || {
                    seen.lock().push(i);
                    let _ = done.send(());
                }),
            )
            .unwrap();
        }
        for _ in 0..10 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_queue_is_rejected() {
        // Not started, so nothing drains the queues.
        let pool = WorkerPool::new(&test_log(), 2, 2);
        pool.submit(0, Box::new(|| {})).unwrap();
        match pool.submit(0, Box::new(|| {})) {
            Err(OvxError::QueueFull) => {}
            other => panic!("expected QueueFull, got {other:?}"),
        }
        // The other worker still has room.
        pool.submit(1, Box::new(|| {})).unwrap();
    }
}
