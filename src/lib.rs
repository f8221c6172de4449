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

//! # Managed Channel Pool
//!
//! An **affinity-aware channel pool** for RPC clients, built on top of
//! [`tokio`].
//!
//! The pool multiplexes many logical RPCs across a bounded set of transport
//! channels, with support for:
//!
//! - **Least-busy channel selection** with a concurrent-streams low watermark
//! - **Affinity routing**: pin related RPCs to one channel by a key
//!   extracted from request or response payloads (`BIND` / `UNBIND` /
//!   `BOUND` commands)
//! - **Deferred call start**: per-call configuration is buffered until the
//!   first outbound message arrives, so routing can depend on it
//! - **Per-channel metrics** (active streams, bound keys)
//!
//! ## Core Concepts
//!
//! - A [`RawChannel`] / [`RawCall`] pair abstracts the underlying transport;
//!   the pool is handed a [`ChannelFactory`] and never connects on its own.
//! - A [`ChannelRef`] is one transport channel plus its active-stream count.
//! - [`ChannelPool`] owns the channels, the key-to-channel affinity index
//!   and the per-method [`AffinityConfig`] registry, and hands out calls.
//! - A [`PooledCall`] is either a [`DeferredCall`] (affinity-configured
//!   method) or a [`SimpleCall`] (plain least-busy routing).
//!
//! ## Example
//!
//! ```rust,no_run
//! use managed_channel_pool::{
//!     ApiConfig, CallListener, CallOptions, ChannelPool, Metadata, RawCall, RawChannel, Status,
//! };
//! use std::sync::Arc;
//!
//! // A stand-in transport; real deployments adapt their RPC client here.
//! struct LoopbackCall;
//!
//! impl RawCall<String, String> for LoopbackCall {
//!     fn start(&self, _listener: Box<dyn CallListener<String>>, _headers: Metadata) {}
//!     fn request(&self, _count: u32) {}
//!     fn set_message_compression(&self, _enabled: bool) {}
//!     fn send_message(&self, _message: String) {}
//!     fn half_close(&self) {}
//!     fn cancel(&self, _message: &str, _cause: Option<anyhow::Error>) {}
//! }
//!
//! struct LoopbackChannel;
//!
//! impl RawChannel<String, String> for LoopbackChannel {
//!     fn new_call(&self, _method: &str, _options: CallOptions) -> Arc<dyn RawCall<String, String>> {
//!         Arc::new(LoopbackCall)
//!     }
//! }
//!
//! struct PrintListener;
//!
//! impl CallListener<String> for PrintListener {
//!     fn on_message(&mut self, message: String) {
//!         println!("response: {message}");
//!     }
//!     fn on_close(&mut self, status: Status, _trailers: Metadata) {
//!         println!("closed: {:?}", status.code);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ApiConfig::from_json(
//!         r#"{
//!             "channelPool": { "maxSize": 4, "maxConcurrentStreamsLowWatermark": 2 },
//!             "method": [{
//!                 "name": ["/example.Sessions/Create"],
//!                 "affinity": { "command": "BIND", "affinityKey": "name" }
//!             }]
//!         }"#,
//!     )?;
//!
//!     let pool = ChannelPool::new(
//!         config,
//!         Arc::new(|| Arc::new(LoopbackChannel) as Arc<dyn RawChannel<String, String>>),
//!         Arc::new(|message: &String, _path: &str| Ok(Some(message.clone()))),
//!         Arc::new(|message: &String, _path: &str| Ok(Some(message.clone()))),
//!     )?;
//!
//!     // The channel is picked when the first message goes out, so the
//!     // session key inside it can steer routing.
//!     let call = pool.new_call("/example.Sessions/Create", CallOptions::default())?;
//!     call.start(Box::new(PrintListener), Metadata::new());
//!     call.send_message("session-42".to_string()).await?;
//!     call.half_close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## When to Use
//!
//! - Spreading a high-QPS client over several HTTP/2 connections without
//!   giving up session affinity
//! - Respecting a transport's per-connection concurrent-stream limit by
//!   growing the connection set on demand, up to a cap
//! - Keying calls to the channel that created a server-side resource (the
//!   `BIND` / `BOUND` / `UNBIND` lifecycle)
//!
//! ## Limitations
//!
//! - The pool never retries a call; retry policy belongs to a higher layer.
//! - Affinity bindings are in-memory only and do not survive a restart.
//! - Shutdown draining is delegated to the transport.
//!
//! ## License
//!
//! Licensed under [Apache 2.0](https://www.apache.org/licenses/LICENSE-2.0).

mod constants;

pub mod channel_pool;
pub mod client_call;
pub mod config;
pub mod error;
pub mod transport;

pub use channel_pool::{ChannelMetrics, ChannelPool, ChannelRef};
pub use client_call::{DeferredCall, PooledCall, SimpleCall};
pub use config::{AffinityCommand, AffinityConfig, ApiConfig, ChannelPoolConfig, MethodConfig};
pub use constants::{DEFAULT_MAX_SIZE, DEFAULT_STREAMS_LOW_WATERMARK};
pub use error::{PoolError, PoolResult};
pub use transport::{
    CallAttributes, CallListener, CallOptions, ChannelFactory, KeyExtractor, Metadata, RawCall,
    RawChannel, Status, StatusCode,
};
