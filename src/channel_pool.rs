// Copyright 2025 Google LLC
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

use crate::client_call::{DeferredCall, PooledCall, SimpleCall};
use crate::config::{AffinityCommand, AffinityConfig, ApiConfig, ChannelPoolConfig};
use crate::error::{PoolError, PoolResult};
use crate::transport::{CallOptions, ChannelFactory, KeyExtractor, RawChannel};
use dashmap::DashMap;
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One underlying transport channel plus its stream bookkeeping.
pub struct ChannelRef<Req, Resp> {
    id: usize,
    channel: Arc<dyn RawChannel<Req, Resp>>,
    active_streams: AtomicUsize,
}

impl<Req, Resp> ChannelRef<Req, Resp> {
    fn new(id: usize, channel: Arc<dyn RawChannel<Req, Resp>>) -> Self {
        Self {
            id,
            channel,
            active_streams: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn channel(&self) -> &Arc<dyn RawChannel<Req, Resp>> {
        &self.channel
    }

    pub fn stream_count(&self) -> usize {
        self.active_streams.load(Ordering::Relaxed)
    }

    pub(crate) fn streams_incr(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    /// Aborts on underflow: a zero count means a decrement was already paid
    /// for this stream, and continuing would corrupt selection.
    pub(crate) fn streams_decr(&self) {
        let prev = self.active_streams.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            error!("stream count underflow on channel {}", self.id);
            std::process::abort();
        }
    }
}

impl<Req, Resp> fmt::Debug for ChannelRef<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRef")
            .field("id", &self.id)
            .field("active_streams", &self.stream_count())
            .finish()
    }
}

/// Key-to-channel bindings, forward and (for diagnostics) reverse.
///
/// Both maps live behind one mutex so a key seen in the forward map always
/// appears under the same channel in the reverse map.
struct AffinityIndex<Req, Resp> {
    inner: Mutex<IndexInner<Req, Resp>>,
}

struct IndexInner<Req, Resp> {
    forward: HashMap<String, Arc<ChannelRef<Req, Resp>>>,
    reverse: HashMap<usize, HashSet<String>>,
}

impl<Req, Resp> AffinityIndex<Req, Resp> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(IndexInner {
                forward: HashMap::new(),
                reverse: HashMap::new(),
            }),
        }
    }

    fn lookup(&self, key: &str) -> Option<Arc<ChannelRef<Req, Resp>>> {
        self.inner.lock().forward.get(key).cloned()
    }

    fn bind(&self, channel_ref: &Arc<ChannelRef<Req, Resp>>, key: &str) {
        if key.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(prev) = inner
            .forward
            .insert(key.to_string(), Arc::clone(channel_ref))
        {
            if prev.id() != channel_ref.id() {
                warn!(
                    "affinity key {:?} rebound from channel {} to channel {}",
                    key,
                    prev.id(),
                    channel_ref.id()
                );
                if let Some(keys) = inner.reverse.get_mut(&prev.id()) {
                    keys.remove(key);
                    if keys.is_empty() {
                        inner.reverse.remove(&prev.id());
                    }
                }
            }
        }
        inner
            .reverse
            .entry(channel_ref.id())
            .or_default()
            .insert(key.to_string());
    }

    fn unbind(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(owner) = inner.forward.remove(key) {
            if let Some(keys) = inner.reverse.get_mut(&owner.id()) {
                keys.remove(key);
                if keys.is_empty() {
                    inner.reverse.remove(&owner.id());
                }
            }
        }
    }

    fn key_count(&self) -> usize {
        self.inner.lock().forward.len()
    }

    fn keys_on(&self, channel_id: usize) -> usize {
        self.inner
            .lock()
            .reverse
            .get(&channel_id)
            .map_or(0, HashSet::len)
    }
}

/// Point-in-time view of one channel, for dashboards and logs.
#[derive(Debug, Serialize)]
pub struct ChannelMetrics {
    pub channel_id: usize,
    pub active_streams: usize,
    pub affinity_keys: usize,
}

/// Channel pool with least-busy selection + affinity routing.
///
/// The pool owns a bounded, lazily grown set of [`ChannelRef`]s. Calls on
/// methods with an [`AffinityConfig`] are routed by the key extracted from
/// their payloads; everything else lands on the channel with the fewest
/// active streams.
pub struct ChannelPool<Req, Resp> {
    config: ChannelPoolConfig,
    channels: Mutex<Vec<Arc<ChannelRef<Req, Resp>>>>,
    affinity: AffinityIndex<Req, Resp>,
    methods: DashMap<String, AffinityConfig>,
    factory: ChannelFactory<Req, Resp>,
    request_key: KeyExtractor<Req>,
    response_key: KeyExtractor<Resp>,
    shutdown: AtomicBool,
}

impl<Req, Resp> ChannelPool<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(
        config: ApiConfig,
        factory: ChannelFactory<Req, Resp>,
        request_key: KeyExtractor<Req>,
        response_key: KeyExtractor<Resp>,
    ) -> PoolResult<Arc<Self>> {
        config.channel_pool.validate()?;
        let methods = DashMap::new();
        for method in &config.method {
            if let Some(affinity) = &method.affinity {
                for name in &method.name {
                    methods.insert(name.clone(), affinity.clone());
                }
            }
        }
        Ok(Arc::new(Self {
            config: config.channel_pool,
            channels: Mutex::new(Vec::new()),
            affinity: AffinityIndex::new(),
            methods,
            factory,
            request_key,
            response_key,
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Attach an affinity descriptor to a method after construction.
    pub fn register_affinity(&self, method: impl Into<String>, affinity: AffinityConfig) {
        self.methods.insert(method.into(), affinity);
    }

    /// Create a call facade for `method`.
    ///
    /// Methods with an affinity descriptor get a [`DeferredCall`], which
    /// picks its channel once the first request message is available.
    /// Everything else gets a [`SimpleCall`] on the least-busy channel.
    pub fn new_call(
        self: &Arc<Self>,
        method: &str,
        options: CallOptions,
    ) -> PoolResult<PooledCall<Req, Resp>> {
        if self.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        match self.affinity_for(method) {
            Some(affinity) => Ok(PooledCall::Deferred(DeferredCall::new(
                Arc::clone(self),
                method.to_string(),
                options,
                affinity,
            ))),
            None => Ok(PooledCall::Simple(SimpleCall::new(
                Arc::clone(self),
                self.pick_least_busy(),
                method,
                options,
            ))),
        }
    }

    /// The channel bound to `key`, or the least-busy one when the key is
    /// absent, empty, or unbound.
    pub(crate) fn pick_for_key(&self, key: Option<&str>) -> Arc<ChannelRef<Req, Resp>> {
        if let Some(key) = key.filter(|k| !k.is_empty()) {
            if let Some(channel_ref) = self.affinity.lookup(key) {
                debug!(
                    "affinity key {:?} hits channel {}",
                    key,
                    channel_ref.id()
                );
                return channel_ref;
            }
        }
        self.pick_least_busy()
    }

    /// Selection: reuse the channel with the fewest active streams while it
    /// is under the low watermark or the pool is full; otherwise grow.
    /// Ties go to the lowest channel id.
    pub(crate) fn pick_least_busy(&self) -> Arc<ChannelRef<Req, Resp>> {
        let mut channels = self.channels.lock();
        if let Some(min_ref) = channels.iter().min_by_key(|r| r.stream_count()).cloned() {
            if min_ref.stream_count() < self.config.max_concurrent_streams_low_watermark
                || channels.len() >= self.config.max_size
            {
                debug!(
                    "channel {} selected, active streams {}",
                    min_ref.id(),
                    min_ref.stream_count()
                );
                return min_ref;
            }
        }
        let id = channels.len();
        let channel_ref = Arc::new(ChannelRef::new(id, (self.factory)()));
        channels.push(Arc::clone(&channel_ref));
        debug!("channel {} created, pool size now {}", id, channels.len());
        channel_ref
    }

    pub fn bind(&self, channel_ref: &Arc<ChannelRef<Req, Resp>>, key: &str) {
        self.affinity.bind(channel_ref, key);
    }

    pub fn unbind(&self, key: &str) {
        self.affinity.unbind(key);
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<ChannelRef<Req, Resp>>> {
        self.affinity.lookup(key)
    }

    pub(crate) fn affinity_for(&self, method: &str) -> Option<AffinityConfig> {
        self.methods.get(method).map(|entry| entry.clone())
    }

    /// Key carried by an outgoing request, when the method's command routes
    /// on the request side (`BOUND`, `UNBIND`).
    pub(crate) fn extract_request_key(&self, message: &Req, method: &str) -> Option<String> {
        let affinity = self.affinity_for(method)?;
        match affinity.command {
            AffinityCommand::Bound | AffinityCommand::Unbind => {}
            AffinityCommand::Bind => return None,
        }
        apply_extractor(&self.request_key, message, &affinity.affinity_key, method)
    }

    /// Key carried by an incoming response, when the method's command binds
    /// on the response side (`BIND`).
    pub(crate) fn extract_response_key(&self, message: &Resp, method: &str) -> Option<String> {
        let affinity = self.affinity_for(method)?;
        if affinity.command != AffinityCommand::Bind {
            return None;
        }
        apply_extractor(&self.response_key, message, &affinity.affinity_key, method)
    }

    pub fn size(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn affinity_key_count(&self) -> usize {
        self.affinity.key_count()
    }

    pub fn metrics(&self) -> Vec<ChannelMetrics> {
        self.channels
            .lock()
            .iter()
            .map(|r| ChannelMetrics {
                channel_id: r.id(),
                active_streams: r.stream_count(),
                affinity_keys: self.affinity.keys_on(r.id()),
            })
            .collect()
    }

    /// Stop handing out calls and shut every channel down. Draining of
    /// in-flight streams is the transport's responsibility.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for channel_ref in self.channels.lock().iter() {
            channel_ref.channel().shutdown();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn apply_extractor<M>(
    extractor: &KeyExtractor<M>,
    message: &M,
    key_path: &str,
    method: &str,
) -> Option<String> {
    if key_path.is_empty() {
        return None;
    }
    match extractor(message, key_path) {
        Ok(Some(key)) if !key.is_empty() => Some(key),
        Ok(_) => None,
        Err(e) => {
            warn!("affinity key extraction failed for {}: {:#}", method, e);
            None
        }
    }
}
