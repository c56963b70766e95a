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

//! Expiring-connection timer: an indexed binary min-heap on deadlines.
//!
//! Keys are connection tokens; the `token -> heap index` map makes
//! [`adjust`] and [`remove`] O(log n) instead of a linear scan. Deadlines
//! use [`Instant`] so wall-clock changes cannot spuriously expire
//! connections.
//!
//! [`adjust`]: TimerHeap::adjust
//! [`remove`]: TimerHeap::remove

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mio::Token;

#[derive(Debug, Clone, Copy)]
struct TimerNode {
    id: Token,
    deadline: Instant,
}

/// Vector-backed min-heap of connection deadlines plus an index map.
///
/// The expiry action is supplied by the caller at tick time and receives
/// only the token; the reactor resolves it against its connection table, so
/// no node holds a reference back into the reactor.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<Token, usize>,
}

impl TimerHeap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        TimerHeap {
            heap: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Live timer entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when no timers are armed.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Whether `id` has a pending deadline.
    pub fn contains(&self, id: Token) -> bool {
        self.index.contains_key(&id)
    }

    /// The pending deadline for `id`, if any.
    pub fn deadline(&self, id: Token) -> Option<Instant> {
        self.index.get(&id).map(|&i| self.heap[i].deadline)
    }

    /// Arms (or re-arms) `id` to expire after `timeout`.
    pub fn add(&mut self, id: Token, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        match self.index.get(&id) {
            Some(&i) => {
                self.heap[i].deadline = deadline;
                self.sift_down(i);
                self.sift_up(i);
            }
            None => {
                let i = self.heap.len();
                self.heap.push(TimerNode { id, deadline });
                self.index.insert(id, i);
                self.sift_up(i);
            }
        }
    }

    /// Pushes the deadline of an armed `id` out to `now + timeout`.
    /// Arms it fresh when absent.
    pub fn adjust(&mut self, id: Token, timeout: Duration) {
        self.add(id, timeout);
    }

    /// Removes the entry for `id`, if any.
    pub fn remove(&mut self, id: Token) {
        let i = match self.index.remove(&id) {
            Some(i) => i,
            None => return,
        };
        let last = self.heap.len() - 1;
        if i != last {
            self.heap.swap(i, last);
            self.index.insert(self.heap[i].id, i);
        }
        self.heap.pop();
        if i < self.heap.len() {
            self.sift_down(i);
            self.sift_up(i);
        }
    }

    /// Runs the expiry action for `id` now and removes its entry.
    pub fn fire<F: FnOnce(Token)>(&mut self, id: Token, expire: F) {
        if self.contains(id) {
            expire(id);
            self.remove(id);
        }
    }

    /// Pops every entry whose deadline has passed, returning the expired
    /// tokens in deadline order.
    pub fn tick(&mut self) -> Vec<Token> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(top) = self.heap.first() {
            if top.deadline > now {
                break;
            }
            let id = top.id;
            expired.push(id);
            self.remove(id);
        }
        expired
    }

    /// Time until the nearest deadline, floored at zero; `None` when no
    /// timer is armed. Call [`tick`](TimerHeap::tick) first so the answer
    /// reflects only live entries.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.heap
            .first()
            .map(|top| top.deadline.saturating_duration_since(Instant::now()))
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id, a);
        self.index.insert(self.heap[b].id, b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].deadline >= self.heap[parent].deadline {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < len && self.heap[right].deadline < self.heap[left].deadline {
                child = right;
            }
            if self.heap[i].deadline <= self.heap[child].deadline {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
    }
}
