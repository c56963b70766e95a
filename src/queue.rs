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

//! Bounded blocking FIFO with a terminal closed state.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
    deq: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO with producer and consumer condition variables.
///
/// Producers block while the queue is full; consumers block while it is
/// empty. [`close`] is idempotent and wakes everyone: producers fail fast,
/// consumers keep draining until the queue is empty and only then observe
/// the closed state, so no in-flight item is lost.
///
/// [`close`]: BlockingQueue::close
pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BlockingQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        BlockingQueue {
            inner: Mutex::new(Inner {
                deq: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Appends at the tail, blocking while the queue is full.
    ///
    /// Returns the item when the queue has been closed.
    pub fn push_back(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.deq.len() >= self.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return Err(item);
        }
        inner.deq.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Prepends at the head, blocking while the queue is full.
    ///
    /// Returns the item when the queue has been closed.
    pub fn push_front(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.deq.len() >= self.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return Err(item);
        }
        inner.deq.push_front(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pops the head, blocking while the queue is empty.
    ///
    /// Returns `None` only once the queue is both empty and closed.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.deq.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Pops the head, giving up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.deq.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let (guard, res) = self.not_empty.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if res.timed_out() {
                let item = inner.deq.pop_front();
                if item.is_some() {
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// Wakes one consumer without enqueueing anything.
    pub fn flush(&self) {
        self.not_empty.notify_one();
    }

    /// Closes the queue and wakes every waiter. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether [`close`](BlockingQueue::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deq.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// The fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops everything queued and frees blocked producers.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.deq.clear();
        drop(inner);
        self.not_full.notify_all();
    }
}

impl<T> fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("BlockingQueue")
            .field("len", &inner.deq.len())
            .field("capacity", &self.capacity)
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::BlockingQueue;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn queue_is_fifo_per_enqueue_order() {
        let q = BlockingQueue::new(8);
        for i in 0..5 {
            q.push_back(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(Some(i), q.pop());
        }
    }

    #[test]
    fn push_front_jumps_the_line() {
        let q = BlockingQueue::new(8);
        q.push_back(1).unwrap();
        q.push_front(0).unwrap();
        assert_eq!(Some(0), q.pop());
        assert_eq!(Some(1), q.pop());
    }

    #[test]
    fn close_delivers_in_flight_items_before_failing() {
        let q = BlockingQueue::new(8);
        q.push_back("a").unwrap();
        q.push_back("b").unwrap();
        q.close();
        q.close(); // idempotent

        assert_eq!(Some("a"), q.pop());
        assert_eq!(Some("b"), q.pop());
        assert_eq!(None, q.pop());
        assert_eq!(Err("c"), q.push_back("c"));
    }

    #[test]
    fn full_queue_blocks_producer_until_consumed() {
        let q = Arc::new(BlockingQueue::new(1));
        q.push_back(1).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push_back(2))
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(Some(1), q.pop());
        producer.join().unwrap().unwrap();
        assert_eq!(Some(2), q.pop());
    }

    #[test]
    fn pop_blocks_until_item_arrives() {
        let q = Arc::new(BlockingQueue::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };

        thread::sleep(Duration::from_millis(50));
        q.push_back(42).unwrap();
        assert_eq!(Some(42), consumer.join().unwrap());
    }

    #[test]
    fn pop_timeout_expires_on_an_empty_queue() {
        let q: BlockingQueue<u8> = BlockingQueue::new(4);
        assert_eq!(None, q.pop_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn close_wakes_a_blocked_consumer() {
        let q: Arc<BlockingQueue<u8>> = Arc::new(BlockingQueue::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };

        thread::sleep(Duration::from_millis(50));
        q.close();
        assert_eq!(None, consumer.join().unwrap());
    }
}
