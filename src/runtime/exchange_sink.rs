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
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::common::config::{exchange_sink_buffer_capacity, exchange_sink_keepalive_ms};
use crate::common::types::format_uuid;
use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::minirocks_logging::debug;
use crate::runtime::exchange_buffer::ExchangeBuffer;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExchangeKey {
    pub finst_id_hi: i64,
    pub finst_id_lo: i64,
    pub node_id: i32,
}

impl ExchangeKey {
    #[inline]
    pub(crate) fn finst_uuid(&self) -> String {
        format_uuid(self.finst_id_hi, self.finst_id_lo)
    }
}

const CANCELED_KEYS_TTL: Duration = Duration::from_secs(600);
const CANCELED_KEYS_MAX_SIZE: usize = 8192;
const SINK_FETCH_LOG_EVERY: u64 = 4096;

static NEXT_SINK_ID: AtomicUsize = AtomicUsize::new(1);
static SINK_FETCH_LOG_COUNT: AtomicU64 = AtomicU64::new(0);

fn should_log_fetch() -> bool {
    SINK_FETCH_LOG_COUNT.fetch_add(1, Ordering::Relaxed) % SINK_FETCH_LOG_EVERY == 0
}

static CANCELED_KEYS: OnceLock<Mutex<HashMap<ExchangeKey, Instant>>> = OnceLock::new();

fn canceled_keys() -> &'static Mutex<HashMap<ExchangeKey, Instant>> {
    CANCELED_KEYS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cleanup_canceled_keys_locked(keys: &mut HashMap<ExchangeKey, Instant>, now: Instant) {
    keys.retain(|_, ts| now.duration_since(*ts) <= CANCELED_KEYS_TTL);
    if keys.len() > CANCELED_KEYS_MAX_SIZE {
        keys.clear();
    }
}

fn mark_key_canceled(key: ExchangeKey) {
    let now = Instant::now();
    let mut guard = canceled_keys().lock().expect("exchange canceled keys lock");
    cleanup_canceled_keys_locked(&mut guard, now);
    guard.insert(key, now);
}

fn is_key_canceled(key: &ExchangeKey) -> bool {
    let now = Instant::now();
    let mut guard = canceled_keys().lock().expect("exchange canceled keys lock");
    cleanup_canceled_keys_locked(&mut guard, now);
    guard.contains_key(key)
}

/// Pull request issued by the consumer side of an exchange.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExchangeRequest {
    /// True when the sources already hold every page they need. The sink treats
    /// this as an irrevocable instruction to drop buffered pages and wind down.
    pub sources_finished: bool,
}

#[derive(Debug)]
pub struct ExchangeResponse {
    pub page: Option<Page>,
    /// True once no further page will ever be produced. A `None` page with
    /// `finished == false` is a transient empty race; the consumer re-requests.
    pub finished: bool,
}

/// Callback resolved exactly once per pull request. It may run on the thread
/// submitting the request or on whichever thread unblocked the dispatch.
pub type PageListener = Box<dyn FnOnce(ExchangeResponse) + Send + 'static>;

/// Producer side of one point-to-point exchange. Buffers pages from local
/// sink handles and matches them to asynchronous pull requests.
#[derive(Debug)]
pub struct ExchangeSinkHandler {
    sink_id: usize,
    buffer: ExchangeBuffer,
    listeners: SegQueue<PageListener>,
    outstanding_sinks: AtomicUsize,
    all_sources_finished: AtomicBool,
    // Dispatch token. Only the holder pairs a listener with a page, so each
    // request is resolved exactly once.
    promised: AtomicBool,
    added_pages: AtomicU64,
    added_rows: AtomicU64,
    delivered_pages: AtomicU64,
    delivered_rows: AtomicU64,
    fetch_requests: AtomicU64,
    discarded_pages: AtomicU64,
    created: Instant,
    last_update_ms: AtomicU64,
}

impl ExchangeSinkHandler {
    pub fn new(max_buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            sink_id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
            buffer: ExchangeBuffer::new(max_buffer_size),
            listeners: SegQueue::new(),
            outstanding_sinks: AtomicUsize::new(0),
            all_sources_finished: AtomicBool::new(false),
            promised: AtomicBool::new(false),
            added_pages: AtomicU64::new(0),
            added_rows: AtomicU64::new(0),
            delivered_pages: AtomicU64::new(0),
            delivered_rows: AtomicU64::new(0),
            fetch_requests: AtomicU64::new(0),
            discarded_pages: AtomicU64::new(0),
            created: Instant::now(),
            last_update_ms: AtomicU64::new(0),
        })
    }

    pub fn sink_id(&self) -> usize {
        self.sink_id
    }

    /// Opens one more producer handle. The handler completes only after every
    /// handle created here has called `finish`.
    pub fn create_exchange_sink(self: &Arc<Self>) -> ExchangeSink {
        let outstanding = self.outstanding_sinks.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "exchange sink handle CREATED: sink_id={} outstanding={}",
            self.sink_id, outstanding
        );
        ExchangeSink {
            handler: Arc::clone(self),
            finished: AtomicBool::new(false),
        }
    }

    /// Registers one pull request. The listener is resolved exactly once, now
    /// or whenever a page or completion becomes available.
    pub fn fetch_page_async(&self, request: ExchangeRequest, listener: PageListener) {
        self.touch();
        self.fetch_requests.fetch_add(1, Ordering::Relaxed);
        if request.sources_finished {
            self.mark_all_sources_finished();
        }
        if should_log_fetch() {
            debug!(
                "exchange sink fetch: sink_id={} buffered={} pending={} sources_finished={}",
                self.sink_id,
                self.buffer.size(),
                self.listeners.len(),
                request.sources_finished
            );
        }
        if self.all_sources_finished.load(Ordering::Acquire) {
            listener(ExchangeResponse {
                page: None,
                finished: true,
            });
        } else {
            self.listeners.push(listener);
        }
        self.notify_listeners();
    }

    /// Irrevocable teardown: drops buffered pages and resolves every pending
    /// request with completion.
    pub fn cancel(&self) {
        self.mark_all_sources_finished();
        self.notify_listeners();
    }

    pub fn is_finished(&self) -> bool {
        self.all_sources_finished.load(Ordering::Acquire) || self.buffer.is_fully_complete()
    }

    pub fn buffered_pages(&self) -> usize {
        self.buffer.size()
    }

    pub fn pending_requests(&self) -> usize {
        self.listeners.len()
    }

    pub fn outstanding_sinks(&self) -> usize {
        self.outstanding_sinks.load(Ordering::Acquire)
    }

    pub fn idle_time(&self) -> Duration {
        let now_ms = self.created.elapsed().as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(self.last_update_ms.load(Ordering::Acquire)))
    }

    pub fn stats_snapshot(&self) -> ExchangeSinkSnapshot {
        ExchangeSinkSnapshot {
            buffered_pages: self.buffer.size(),
            pending_requests: self.listeners.len(),
            outstanding_sinks: self.outstanding_sinks.load(Ordering::Acquire),
            producers_complete: self.buffer.is_producers_complete(),
            fully_complete: self.buffer.is_fully_complete(),
            all_sources_finished: self.all_sources_finished.load(Ordering::Acquire),
            added_pages: self.added_pages.load(Ordering::Relaxed),
            added_rows: self.added_rows.load(Ordering::Relaxed),
            delivered_pages: self.delivered_pages.load(Ordering::Relaxed),
            delivered_rows: self.delivered_rows.load(Ordering::Relaxed),
            fetch_requests: self.fetch_requests.load(Ordering::Relaxed),
            discarded_pages: self.discarded_pages.load(Ordering::Relaxed),
        }
    }

    fn touch(&self) {
        self.last_update_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Release);
    }

    fn mark_all_sources_finished(&self) {
        if !self.all_sources_finished.swap(true, Ordering::AcqRel) {
            self.buffer.mark_producers_complete();
            let discarded = self.buffer.discard_pages();
            if discarded > 0 {
                self.discarded_pages
                    .fetch_add(discarded as u64, Ordering::Relaxed);
            }
            debug!(
                "exchange sink CANCELED: sink_id={} discarded_pages={} pending_requests={}",
                self.sink_id,
                discarded,
                self.listeners.len()
            );
        }
    }

    fn notify_listeners(&self) {
        while !self.listeners.is_empty()
            && (self.buffer.size() > 0 || self.buffer.is_producers_complete())
        {
            if self
                .promised
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                break;
            }
            // Pop and pair under the token. `pop` can still return None when the
            // emptiness check raced a concurrent enqueue.
            let paired = match self.listeners.pop() {
                Some(listener) => {
                    let page = self.buffer.pop_page();
                    let finished = self.buffer.is_fully_complete();
                    Some((listener, ExchangeResponse { page, finished }))
                }
                None => None,
            };
            self.promised.store(false, Ordering::Release);
            let (listener, response) = match paired {
                Some(v) => v,
                None => continue,
            };
            if let Some(page) = response.page.as_ref() {
                self.delivered_pages.fetch_add(1, Ordering::Relaxed);
                self.delivered_rows
                    .fetch_add(page.len() as u64, Ordering::Relaxed);
            }
            // Run the callback outside the token so a slow listener cannot stall
            // other dispatchers.
            listener(response);
        }
    }
}

/// Per-producer handle feeding one `ExchangeSinkHandler`.
pub struct ExchangeSink {
    handler: Arc<ExchangeSinkHandler>,
    finished: AtomicBool,
}

impl ExchangeSink {
    /// Appends one page. Never rejects; after teardown the page is silently
    /// dropped.
    pub fn add_page(&self, page: Page) {
        if self.handler.all_sources_finished.load(Ordering::Acquire) {
            debug!(
                "exchange sink add_page: CANCELED, dropping page ({} rows): sink_id={}",
                page.len(),
                self.handler.sink_id
            );
            return;
        }
        self.handler.touch();
        self.handler.added_pages.fetch_add(1, Ordering::Relaxed);
        self.handler
            .added_rows
            .fetch_add(page.len() as u64, Ordering::Relaxed);
        self.handler.buffer.push_page(page);
        self.handler.notify_listeners();
    }

    /// Marks this handle complete. Idempotent; the handler's buffer is marked
    /// producers-complete when the last outstanding handle finishes.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handler.touch();
        if self.handler.outstanding_sinks.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!(
                "exchange sink producers FINISHED: sink_id={} buffered_pages={}",
                self.handler.sink_id,
                self.handler.buffer.size()
            );
            self.handler.buffer.mark_producers_complete();
            self.handler.notify_listeners();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
            || self.handler.all_sources_finished.load(Ordering::Acquire)
    }

    /// Advisory backpressure signal; see `ExchangeBuffer::await_writable`.
    pub fn await_writable(&self) -> DependencyHandle {
        self.handler.buffer.await_writable()
    }
}

#[derive(Clone, Debug)]
pub struct ExchangeSinkSnapshot {
    pub buffered_pages: usize,
    pub pending_requests: usize,
    pub outstanding_sinks: usize,
    pub producers_complete: bool,
    pub fully_complete: bool,
    pub all_sources_finished: bool,
    pub added_pages: u64,
    pub added_rows: u64,
    pub delivered_pages: u64,
    pub delivered_rows: u64,
    pub fetch_requests: u64,
    pub discarded_pages: u64,
}

static SINKS: OnceLock<Mutex<HashMap<ExchangeKey, Arc<ExchangeSinkHandler>>>> = OnceLock::new();

fn sinks() -> &'static Mutex<HashMap<ExchangeKey, Arc<ExchangeSinkHandler>>> {
    SINKS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn get_or_create_sink_handler(key: ExchangeKey) -> Result<Arc<ExchangeSinkHandler>, String> {
    use crate::minirocks_logging::debug;

    if is_key_canceled(&key) {
        return Err("exchange canceled".to_string());
    }
    let mut guard = sinks().lock().expect("exchange sink lock");
    // Recheck under the lock. A concurrent cancel marks the tombstone before
    // it takes this lock, so a creator that passed the first check cannot
    // re-insert the key after the cancel swept it.
    if is_key_canceled(&key) {
        return Err("exchange canceled".to_string());
    }
    let existed = guard.contains_key(&key);
    let handler = guard
        .entry(key)
        .or_insert_with(|| ExchangeSinkHandler::new(exchange_sink_buffer_capacity()))
        .clone();
    if !existed {
        debug!(
            "exchange sink CREATED: finst={} node_id={} sink_id={}",
            key.finst_uuid(),
            key.node_id,
            handler.sink_id()
        );
    }
    Ok(handler)
}

pub fn get_sink_handler(key: ExchangeKey) -> Option<Arc<ExchangeSinkHandler>> {
    let guard = sinks().lock().expect("exchange sink lock");
    guard.get(&key).cloned()
}

pub fn cancel_exchange_key(key: ExchangeKey) {
    mark_key_canceled(key);
    let handler = {
        let mut guard = sinks().lock().expect("exchange sink lock");
        guard.remove(&key)
    };
    // Cancel outside the registry lock; listener callbacks may re-enter it.
    if let Some(handler) = handler {
        debug!(
            "exchange sink key CANCELED: finst={} node_id={}",
            key.finst_uuid(),
            key.node_id
        );
        handler.cancel();
    }
}

pub fn cancel_fragment(finst_id_hi: i64, finst_id_lo: i64) {
    let targets: Vec<(ExchangeKey, Arc<ExchangeSinkHandler>)> = {
        let mut guard = sinks().lock().expect("exchange sink lock");
        let keys: Vec<ExchangeKey> = guard
            .keys()
            .copied()
            .filter(|k| k.finst_id_hi == finst_id_hi && k.finst_id_lo == finst_id_lo)
            .collect();
        let mut targets = Vec::with_capacity(keys.len());
        for k in keys {
            mark_key_canceled(k);
            if let Some(handler) = guard.remove(&k) {
                targets.push((k, handler));
            }
        }
        targets
    };
    for (key, handler) in targets {
        debug!(
            "exchange sink fragment CANCELED: finst={} node_id={}",
            key.finst_uuid(),
            key.node_id
        );
        handler.cancel();
    }
}

/// Removes handlers that buffered nothing and saw no activity for the
/// configured keepalive. Returns how many were removed.
pub fn reap_inactive_sinks() -> usize {
    reap_inactive_sinks_with_keep_alive(Duration::from_millis(exchange_sink_keepalive_ms()))
}

pub fn reap_inactive_sinks_with_keep_alive(keep_alive: Duration) -> usize {
    let stale: Vec<(ExchangeKey, Arc<ExchangeSinkHandler>)> = {
        let mut guard = sinks().lock().expect("exchange sink lock");
        let keys: Vec<ExchangeKey> = guard
            .iter()
            .filter(|(_, handler)| {
                handler.buffered_pages() == 0 && handler.idle_time() >= keep_alive
            })
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| guard.remove(&k).map(|handler| (k, handler)))
            .collect()
    };
    let removed = stale.len();
    for (key, handler) in stale {
        debug!(
            "exchange sink REAPED: finst={} node_id={} idle={:?}",
            key.finst_uuid(),
            key.node_id,
            handler.idle_time()
        );
        handler.cancel();
    }
    removed
}

pub fn snapshot_sink_state(key: ExchangeKey) -> Option<ExchangeSinkSnapshot> {
    let handler = {
        let guard = sinks().lock().expect("exchange sink lock");
        guard.get(&key).cloned()
    }?;
    Some(handler.stats_snapshot())
}
