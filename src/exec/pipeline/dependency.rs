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
//! Pipeline dependency primitives.
//!
//! Responsibilities:
//! - Defines readiness flags with observer-based wakeups for blocked producers.
//! - Used by the exchange buffer to signal writability transitions without blocking callers.
//!
//! Key exported interfaces:
//! - Types: `DependencyHandle`, `Dependency`.
//!
//! Current limitations:
//! - Readiness is one-way; a dependency that became ready never goes back to blocked.
//! - Waiters registered after the transition fire immediately instead of waiting for the next edge.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::exec::pipeline::schedule::observer::{Observable, Observer};
use crate::minirocks_logging::debug;

static NEXT_DEP_ID: AtomicUsize = AtomicUsize::new(1);

/// Reference-counted handle to one pipeline dependency object.
pub type DependencyHandle = Arc<Dependency>;

/// Dependency primitive used to model blocked/unblocked execution conditions.
pub struct Dependency {
    id: usize,
    name: String,
    ready: AtomicBool,
    observable: Arc<Observable>,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Dependency {
    pub fn new(name: impl Into<String>) -> DependencyHandle {
        Arc::new(Self {
            id: NEXT_DEP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ready: AtomicBool::new(false),
            observable: Arc::new(Observable::new()),
        })
    }

    /// Dependency born satisfied, for paths that have nothing to wait on.
    pub fn new_ready(name: impl Into<String>) -> DependencyHandle {
        let dep = Self::new(name);
        dep.ready.store(true, Ordering::Release);
        dep
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        let prev = self.ready.swap(true, Ordering::AcqRel);
        if !prev {
            let notify = self.observable.defer_notify();
            notify.arm();
            if should_log_dep(&self.name) {
                debug!(
                    "Dependency ready: dep_id={} name={} observers={}",
                    self.id,
                    self.name,
                    self.observable.num_observers()
                );
            }
        }
    }

    pub fn add_waiter(&self, observer: Observer) {
        let ready_before = self.is_ready();
        if ready_before {
            observer();
            return;
        }
        self.observable.add_observer(observer);
        if should_log_dep(&self.name) {
            debug!(
                "Dependency add_waiter: dep_id={} name={} ready_before={} observers_after={}",
                self.id,
                self.name,
                ready_before,
                self.observable.num_observers()
            );
        }
        if self.is_ready() {
            let notify = self.observable.defer_notify();
            notify.arm();
        }
    }
}

fn should_log_dep(name: &str) -> bool {
    name.starts_with("exchange_sink:")
}
