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

//! The transport seam consumed by the pool.
//!
//! The pool never talks to a concrete transport. It is handed a
//! [`ChannelFactory`] that produces [`RawChannel`]s, and every RPC it routes
//! is a [`RawCall`] obtained from one of those channels. Implementations
//! adapt whatever client stack is in use; the in-tree tests and the
//! `keyed_router` demo implement the traits over in-process queues.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Request or response metadata: an unordered map of ASCII key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    entries: HashMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Canonical RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

/// Final status of an RPC, delivered to [`CallListener::on_close`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Per-call options, passed through to the transport untouched.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub wait_for_ready: bool,
}

/// Transport-level attributes of an established call.
#[derive(Debug, Clone, Default)]
pub struct CallAttributes {
    entries: HashMap<String, String>,
}

impl CallAttributes {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

/// Receiver side of an RPC. The transport invokes these callbacks from its
/// own tasks; implementations must not assume any particular thread.
pub trait CallListener<Resp>: Send {
    fn on_headers(&mut self, headers: Metadata) {
        let _ = headers;
    }

    fn on_message(&mut self, message: Resp);

    fn on_close(&mut self, status: Status, trailers: Metadata);

    fn on_ready(&mut self) {}
}

/// One RPC on an underlying channel.
///
/// Operations are non-blocking: the transport queues work internally, and
/// outcomes are reported through the [`CallListener`] installed by `start`.
pub trait RawCall<Req, Resp>: Send + Sync {
    fn start(&self, listener: Box<dyn CallListener<Resp>>, headers: Metadata);

    /// Request `count` more response messages from the transport.
    fn request(&self, count: u32);

    fn set_message_compression(&self, enabled: bool);

    fn send_message(&self, message: Req);

    fn half_close(&self);

    fn cancel(&self, message: &str, cause: Option<anyhow::Error>);

    fn is_ready(&self) -> bool {
        true
    }

    fn attributes(&self) -> CallAttributes {
        CallAttributes::default()
    }
}

/// One underlying transport channel, shared by many concurrent calls.
pub trait RawChannel<Req, Resp>: Send + Sync {
    fn new_call(&self, method: &str, options: CallOptions) -> Arc<dyn RawCall<Req, Resp>>;

    /// Begin an orderly shutdown. Draining semantics belong to the
    /// transport; the pool only promises not to place new calls afterwards.
    fn shutdown(&self) {}
}

/// Produces a fresh transport channel each time the pool decides to grow.
pub type ChannelFactory<Req, Resp> =
    Arc<dyn Fn() -> Arc<dyn RawChannel<Req, Resp>> + Send + Sync>;

/// Pulls a dotted-path field out of a payload, stringified.
///
/// `Ok(None)` means the field is absent; an `Err` marks the payload as
/// malformed and is treated by the pool as "no key".
pub type KeyExtractor<M> =
    Arc<dyn Fn(&M, &str) -> anyhow::Result<Option<String>> + Send + Sync>;
