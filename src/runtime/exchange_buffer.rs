// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::exec::page::Page;
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};

/// FIFO page buffer between exchange sink handles and the pull dispatcher.
///
/// The queue itself is unbounded; `max_size` only gates the writable signal so
/// producers slow down once the buffer is full. Completion is latched: the
/// buffer reports fully complete only after an empty pop observed producers
/// complete, so the response carrying the last page never claims completion.
#[derive(Debug)]
pub(crate) struct ExchangeBuffer {
    queue: SegQueue<Page>,
    // Incremented before push and decremented after pop, so the count never
    // underflows and is always >= the number of pages actually queued.
    queue_size: AtomicUsize,
    max_size: usize,
    no_more_inputs: AtomicBool,
    fully_complete: AtomicBool,
    not_full: Mutex<Option<DependencyHandle>>,
}

impl ExchangeBuffer {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            queue_size: AtomicUsize::new(0),
            max_size: max_size.max(1),
            no_more_inputs: AtomicBool::new(false),
            fully_complete: AtomicBool::new(false),
            not_full: Mutex::new(None),
        }
    }

    pub(crate) fn push_page(&self, page: Page) {
        self.queue_size.fetch_add(1, Ordering::AcqRel);
        self.queue.push(page);
        // A push racing producers-complete must not strand pages in the queue.
        if self.no_more_inputs.load(Ordering::Acquire) {
            self.discard_pages();
        }
    }

    pub(crate) fn pop_page(&self) -> Option<Page> {
        match self.queue.pop() {
            Some(page) => {
                let size_after = self.queue_size.fetch_sub(1, Ordering::AcqRel) - 1;
                if size_after == self.max_size - 1 {
                    self.notify_not_full();
                }
                Some(page)
            }
            None => {
                if self.no_more_inputs.load(Ordering::Acquire)
                    && self.queue_size.load(Ordering::Acquire) == 0
                {
                    self.fully_complete.store(true, Ordering::Release);
                }
                None
            }
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.queue_size.load(Ordering::Acquire)
    }

    pub(crate) fn mark_producers_complete(&self) {
        self.no_more_inputs.store(true, Ordering::Release);
        if self.queue_size.load(Ordering::Acquire) == 0 {
            self.fully_complete.store(true, Ordering::Release);
        }
        self.notify_not_full();
    }

    pub(crate) fn is_producers_complete(&self) -> bool {
        self.no_more_inputs.load(Ordering::Acquire)
    }

    pub(crate) fn is_fully_complete(&self) -> bool {
        self.fully_complete.load(Ordering::Acquire)
    }

    /// Drops every buffered page and returns how many were dropped.
    pub(crate) fn discard_pages(&self) -> usize {
        let mut discarded = 0usize;
        while self.pop_page().is_some() {
            discarded += 1;
        }
        discarded
    }

    /// Advisory backpressure signal. Ready while the buffer has spare capacity
    /// or no more pages are expected; pushes are never rejected either way.
    pub(crate) fn await_writable(&self) -> DependencyHandle {
        if self.is_writable() {
            return Dependency::new_ready("exchange_sink:writable");
        }
        let mut guard = self.not_full.lock().expect("exchange buffer not-full lock");
        // Recheck under the lock so a concurrent pop cannot leave the caller parked.
        if self.is_writable() {
            return Dependency::new_ready("exchange_sink:writable");
        }
        guard
            .get_or_insert_with(|| Dependency::new("exchange_sink:writable"))
            .clone()
    }

    fn is_writable(&self) -> bool {
        self.size() < self.max_size || self.is_producers_complete()
    }

    fn notify_not_full(&self) {
        let waiter = {
            let mut guard = self.not_full.lock().expect("exchange buffer not-full lock");
            guard.take()
        };
        // Fire outside the lock.
        if let Some(dep) = waiter {
            dep.set_ready();
        }
    }
}
