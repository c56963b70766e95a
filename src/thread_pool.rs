// Copyright 2024 the skiff authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-size worker pool draining a bounded task queue.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::queue::BlockingQueue;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// How many tasks may sit queued before the producer blocks. The reactor is
/// the only producer, so this doubles as a backpressure bound on dispatch.
const TASK_QUEUE_CAPACITY: usize = 1024;

/// Fixed pool of worker threads.
///
/// Each worker repeatedly pops a task and invokes it. No stealing, no
/// priorities. Dropping the pool closes the queue and joins every worker;
/// tasks already queued drain before the workers exit.
pub struct ThreadPool {
    queue: Arc<BlockingQueue<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool of `count` workers.
    ///
    /// # Panics
    ///
    /// Panics when `count` is zero.
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "thread pool needs at least one worker");
        let queue = Arc::new(BlockingQueue::<Task>::new(TASK_QUEUE_CAPACITY));

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    while let Some(task) = queue.pop() {
                        task();
                    }
                })
                .expect("spawn worker thread");
            workers.push(handle);
        }

        ThreadPool { queue, workers }
    }

    /// Enqueues a task and wakes one waiting worker.
    ///
    /// Tasks submitted after shutdown began are dropped.
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.queue.push_back(Box::new(task)).is_err() {
            log::warn!("task dropped: pool is shutting down");
        }
    }

    /// Worker count.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.queue.close();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::ThreadPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    #[test]
    fn pool_runs_submitted_tasks() {
        let pool = ThreadPool::new(4);
        let (tx, rx) = channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.spawn(move || tx.send(i).unwrap());
        }
        let mut got: Vec<i32> = rx.iter().take(16).collect();
        got.sort_unstable();
        assert_eq!((0..16).collect::<Vec<_>>(), got);
    }

    #[test]
    fn drop_drains_queued_tasks_before_joining() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2);
            for _ in 0..64 {
                let counter = Arc::clone(&counter);
                pool.spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(64, counter.load(Ordering::SeqCst));
    }
}
