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

//! Call facades handed out by [`ChannelPool::new_call`].
//!
//! A [`DeferredCall`] delays all transport work until the first outbound
//! message is available, because channel selection may depend on a key
//! inside that message. Until then `start`, `request` and
//! `set_message_compression` are buffered (last writer wins), while
//! `cancel` and `half_close` are rejected. The first `send_message` picks
//! the channel, opens the underlying call, replays the buffered operations
//! and forwards the message; operations arriving while that routine runs
//! wait for it to finish.
//!
//! A [`SimpleCall`] is the no-affinity fast path: it opens its underlying
//! call immediately and only maintains the channel's stream count.

use crate::channel_pool::{ChannelPool, ChannelRef};
use crate::config::{AffinityCommand, AffinityConfig};
use crate::constants::FIRST_SEND_WAIT;
use crate::error::{PoolError, PoolResult};
use crate::transport::{CallAttributes, CallListener, CallOptions, Metadata, RawCall, Status};
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::watch;
use tokio::time::timeout;

const STATE_NEW: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_SENT: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Either call facade, depending on whether the method has affinity.
pub enum PooledCall<Req, Resp> {
    Deferred(DeferredCall<Req, Resp>),
    Simple(SimpleCall<Req, Resp>),
}

impl<Req, Resp> PooledCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn start(&self, listener: Box<dyn CallListener<Resp>>, headers: Metadata) {
        match self {
            Self::Deferred(call) => call.start(listener, headers),
            Self::Simple(call) => call.start(listener, headers),
        }
    }

    pub async fn request(&self, count: u32) -> PoolResult<()> {
        match self {
            Self::Deferred(call) => call.request(count).await,
            Self::Simple(call) => {
                call.request(count);
                Ok(())
            }
        }
    }

    pub async fn set_message_compression(&self, enabled: bool) -> PoolResult<()> {
        match self {
            Self::Deferred(call) => call.set_message_compression(enabled).await,
            Self::Simple(call) => {
                call.set_message_compression(enabled);
                Ok(())
            }
        }
    }

    pub async fn send_message(&self, message: Req) -> PoolResult<()> {
        match self {
            Self::Deferred(call) => call.send_message(message).await,
            Self::Simple(call) => {
                call.send_message(message);
                Ok(())
            }
        }
    }

    pub async fn half_close(&self) -> PoolResult<()> {
        match self {
            Self::Deferred(call) => call.half_close().await,
            Self::Simple(call) => {
                call.half_close();
                Ok(())
            }
        }
    }

    pub async fn cancel(&self, message: &str, cause: Option<anyhow::Error>) -> PoolResult<()> {
        match self {
            Self::Deferred(call) => call.cancel(message, cause).await,
            Self::Simple(call) => {
                call.cancel(message, cause);
                Ok(())
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Self::Deferred(call) => call.is_ready(),
            Self::Simple(call) => call.is_ready(),
        }
    }

    pub fn attributes(&self) -> PoolResult<CallAttributes> {
        match self {
            Self::Deferred(call) => call.attributes(),
            Self::Simple(call) => Ok(call.attributes()),
        }
    }
}

struct DeferredShared<Req, Resp> {
    listener: Option<Box<dyn CallListener<Resp>>>,
    headers: Metadata,
    compression: bool,
    requested: u32,
    selected: Option<Arc<ChannelRef<Req, Resp>>>,
    inner: Option<Arc<dyn RawCall<Req, Resp>>>,
}

/// A call that buffers everything until its first outbound message.
pub struct DeferredCall<Req, Resp> {
    pool: Arc<ChannelPool<Req, Resp>>,
    method: String,
    options: CallOptions,
    affinity: AffinityConfig,
    state: Arc<AtomicU8>,
    shared: Mutex<DeferredShared<Req, Resp>>,
    decremented: Arc<AtomicBool>,
    sent_tx: watch::Sender<bool>,
    sent_rx: watch::Receiver<bool>,
}

impl<Req, Resp> DeferredCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub(crate) fn new(
        pool: Arc<ChannelPool<Req, Resp>>,
        method: String,
        options: CallOptions,
        affinity: AffinityConfig,
    ) -> Self {
        let (sent_tx, sent_rx) = watch::channel(false);
        Self {
            pool,
            method,
            options,
            affinity,
            state: Arc::new(AtomicU8::new(STATE_NEW)),
            shared: Mutex::new(DeferredShared {
                listener: None,
                headers: Metadata::new(),
                compression: true,
                requested: 0,
                selected: None,
                inner: None,
            }),
            decremented: Arc::new(AtomicBool::new(false)),
            sent_tx,
            sent_rx,
        }
    }

    /// Stash the listener and headers without touching the transport.
    /// May be called again before the first send; the last values win.
    pub fn start(&self, listener: Box<dyn CallListener<Resp>>, headers: Metadata) {
        let mut shared = self.shared.lock();
        shared.listener = Some(listener);
        shared.headers = headers;
    }

    /// Buffer the requested-message count before the first send
    /// (overwriting, to match the transport contract), forward after it.
    pub async fn request(&self, count: u32) -> PoolResult<()> {
        {
            let mut shared = self.shared.lock();
            if self.state.load(Ordering::Acquire) == STATE_NEW {
                shared.requested = count;
                return Ok(());
            }
        }
        self.wait_for_sent().await?;
        self.inner_call()?.request(count);
        Ok(())
    }

    pub async fn set_message_compression(&self, enabled: bool) -> PoolResult<()> {
        {
            let mut shared = self.shared.lock();
            if self.state.load(Ordering::Acquire) == STATE_NEW {
                shared.compression = enabled;
                return Ok(());
            }
        }
        self.wait_for_sent().await?;
        self.inner_call()?.set_message_compression(enabled);
        Ok(())
    }

    /// Not permitted before the first `send_message`. Afterwards the
    /// channel's stream count is decremented exactly once, whether the
    /// decrement happens here or in the listener's `on_close`.
    pub async fn cancel(&self, message: &str, cause: Option<anyhow::Error>) -> PoolResult<()> {
        if self.state.load(Ordering::Acquire) == STATE_NEW {
            return Err(PoolError::InvalidState(
                "cancel() before send_message() is not permitted",
            ));
        }
        self.wait_for_sent().await?;
        if !self.decremented.swap(true, Ordering::AcqRel) {
            if let Some(selected) = self.shared.lock().selected.clone() {
                selected.streams_decr();
            }
        }
        self.inner_call()?.cancel(message, cause);
        Ok(())
    }

    /// Not permitted before the first `send_message`.
    pub async fn half_close(&self) -> PoolResult<()> {
        if self.state.load(Ordering::Acquire) == STATE_NEW {
            return Err(PoolError::InvalidState(
                "half_close() before send_message() is not permitted",
            ));
        }
        self.wait_for_sent().await?;
        self.inner_call()?.half_close();
        Ok(())
    }

    /// The sole trigger for opening the underlying call. The first caller
    /// routes, opens and replays; concurrent and later callers wait for
    /// that to finish and then forward.
    pub async fn send_message(&self, message: Req) -> PoolResult<()> {
        if self
            .state
            .compare_exchange(
                STATE_NEW,
                STATE_STARTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.open_and_send(message)
        } else {
            self.wait_for_sent().await?;
            self.inner_call()?.send_message(message);
            Ok(())
        }
    }

    pub fn is_ready(&self) -> bool {
        match self.shared.lock().inner.as_ref() {
            Some(inner) => inner.is_ready(),
            None => true,
        }
    }

    /// Transport attributes of the underlying call; invalid until the
    /// first send has completed.
    pub fn attributes(&self) -> PoolResult<CallAttributes> {
        if self.state.load(Ordering::Acquire) < STATE_SENT {
            return Err(PoolError::InvalidState(
                "attributes() before the first send completed",
            ));
        }
        Ok(self.inner_call()?.attributes())
    }

    fn open_and_send(&self, message: Req) -> PoolResult<()> {
        let (listener, headers, compression, requested) = {
            let mut shared = self.shared.lock();
            match shared.listener.take() {
                Some(listener) => (
                    listener,
                    std::mem::take(&mut shared.headers),
                    shared.compression,
                    shared.requested,
                ),
                None => {
                    // Roll the claim back so a correctly ordered sequence
                    // can still run on this call.
                    self.state.store(STATE_NEW, Ordering::Release);
                    return Err(PoolError::InvalidState(
                        "send_message() before start() is not permitted",
                    ));
                }
            }
        };

        let key = self.pool.extract_request_key(&message, &self.method);
        let selected = self.pool.pick_for_key(key.as_deref());
        if self.affinity.command == AffinityCommand::Unbind {
            if let Some(key) = &key {
                self.pool.unbind(key);
            }
        }
        selected.streams_incr();

        let inner = selected.channel().new_call(&self.method, self.options.clone());
        let tracked = TrackedListener::new(
            Arc::clone(&self.pool),
            Arc::clone(&selected),
            Some(Arc::clone(&self.state)),
            Arc::clone(&self.decremented),
            self.method.clone(),
            listener,
        );
        inner.start(Box::new(tracked), headers);
        inner.set_message_compression(compression);
        if requested > 0 {
            inner.request(requested);
        }

        {
            let mut shared = self.shared.lock();
            shared.selected = Some(Arc::clone(&selected));
            shared.inner = Some(Arc::clone(&inner));
        }

        inner.send_message(message);
        self.state.fetch_max(STATE_SENT, Ordering::AcqRel);
        let _ = self.sent_tx.send(true);
        Ok(())
    }

    async fn wait_for_sent(&self) -> PoolResult<()> {
        if self.state.load(Ordering::Acquire) >= STATE_SENT {
            return Ok(());
        }
        let mut sent = self.sent_rx.clone();
        match timeout(FIRST_SEND_WAIT, sent.wait_for(|sent| *sent)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                warn!(
                    "abandoning operation on {}: first send never completed",
                    self.method
                );
                Err(PoolError::WaitInterrupted)
            }
        }
    }

    fn inner_call(&self) -> PoolResult<Arc<dyn RawCall<Req, Resp>>> {
        self.shared
            .lock()
            .inner
            .clone()
            .ok_or(PoolError::InvalidState("underlying call is not open"))
    }
}

/// The no-affinity pass-through: opens its call eagerly and only tracks
/// the channel's stream count.
pub struct SimpleCall<Req, Resp> {
    pool: Arc<ChannelPool<Req, Resp>>,
    channel_ref: Arc<ChannelRef<Req, Resp>>,
    method: String,
    inner: Arc<dyn RawCall<Req, Resp>>,
    started: AtomicBool,
    decremented: Arc<AtomicBool>,
}

impl<Req, Resp> SimpleCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub(crate) fn new(
        pool: Arc<ChannelPool<Req, Resp>>,
        channel_ref: Arc<ChannelRef<Req, Resp>>,
        method: &str,
        options: CallOptions,
    ) -> Self {
        let inner = channel_ref.channel().new_call(method, options);
        Self {
            pool,
            channel_ref,
            method: method.to_string(),
            inner,
            started: AtomicBool::new(false),
            decremented: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self, listener: Box<dyn CallListener<Resp>>, headers: Metadata) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.channel_ref.streams_incr();
        }
        let tracked = TrackedListener::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.channel_ref),
            None,
            Arc::clone(&self.decremented),
            self.method.clone(),
            listener,
        );
        self.inner.start(Box::new(tracked), headers);
    }

    pub fn request(&self, count: u32) {
        self.inner.request(count);
    }

    pub fn set_message_compression(&self, enabled: bool) {
        self.inner.set_message_compression(enabled);
    }

    pub fn send_message(&self, message: Req) {
        self.inner.send_message(message);
    }

    pub fn half_close(&self) {
        self.inner.half_close();
    }

    pub fn cancel(&self, message: &str, cause: Option<anyhow::Error>) {
        if self.started.load(Ordering::Acquire) && !self.decremented.swap(true, Ordering::AcqRel) {
            self.channel_ref.streams_decr();
        }
        self.inner.cancel(message, cause);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub fn attributes(&self) -> CallAttributes {
        self.inner.attributes()
    }
}

/// Forwarding listener that owns the pool-side bookkeeping: bind on the
/// first response when the method says so, decrement the stream count
/// exactly once on close.
struct TrackedListener<Req, Resp> {
    pool: Arc<ChannelPool<Req, Resp>>,
    channel_ref: Arc<ChannelRef<Req, Resp>>,
    state: Option<Arc<AtomicU8>>,
    decremented: Arc<AtomicBool>,
    received: AtomicBool,
    method: String,
    user: Box<dyn CallListener<Resp>>,
}

impl<Req, Resp> TrackedListener<Req, Resp> {
    fn new(
        pool: Arc<ChannelPool<Req, Resp>>,
        channel_ref: Arc<ChannelRef<Req, Resp>>,
        state: Option<Arc<AtomicU8>>,
        decremented: Arc<AtomicBool>,
        method: String,
        user: Box<dyn CallListener<Resp>>,
    ) -> Self {
        Self {
            pool,
            channel_ref,
            state,
            decremented,
            received: AtomicBool::new(false),
            method,
            user,
        }
    }
}

impl<Req, Resp> CallListener<Resp> for TrackedListener<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn on_headers(&mut self, headers: Metadata) {
        self.user.on_headers(headers);
    }

    fn on_message(&mut self, message: Resp) {
        if !self.received.swap(true, Ordering::AcqRel) {
            if let Some(key) = self.pool.extract_response_key(&message, &self.method) {
                self.pool.bind(&self.channel_ref, &key);
            }
        }
        self.user.on_message(message);
    }

    fn on_close(&mut self, status: Status, trailers: Metadata) {
        if !self.decremented.swap(true, Ordering::AcqRel) {
            self.channel_ref.streams_decr();
        }
        if let Some(state) = &self.state {
            state.fetch_max(STATE_CLOSED, Ordering::AcqRel);
        }
        self.user.on_close(status, trailers);
    }

    fn on_ready(&mut self) {
        self.user.on_ready();
    }
}
