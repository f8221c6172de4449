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

//! In-process mock transport shared by the integration tests.
//!
//! Messages are plain strings; a request or response of the form `key=<k>`
//! carries the affinity key `<k>`, anything else carries none.

#![allow(dead_code)]

use managed_channel_pool::{
    ApiConfig, CallListener, CallOptions, ChannelFactory, ChannelPool, KeyExtractor, Metadata,
    PoolResult, RawCall, RawChannel, Status,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One scripted call: records every operation in order and lets the test
/// drive the listener by hand.
pub struct MockCall {
    pub method: String,
    state: Mutex<MockCallState>,
}

#[derive(Default)]
struct MockCallState {
    listener: Option<Box<dyn CallListener<String>>>,
    headers: Option<Metadata>,
    sent: Vec<String>,
    ops: Vec<String>,
}

impl MockCall {
    fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            state: Mutex::new(MockCallState::default()),
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn headers(&self) -> Option<Metadata> {
        self.state.lock().headers.clone()
    }

    /// Deliver a response message through the installed listener.
    pub fn deliver(&self, message: &str) {
        let mut state = self.state.lock();
        state
            .listener
            .as_mut()
            .expect("call was never started")
            .on_message(message.to_string());
    }

    /// Close the call through the installed listener.
    pub fn close(&self, status: Status) {
        let mut state = self.state.lock();
        state
            .listener
            .as_mut()
            .expect("call was never started")
            .on_close(status, Metadata::new());
    }
}

impl RawCall<String, String> for MockCall {
    fn start(&self, listener: Box<dyn CallListener<String>>, headers: Metadata) {
        let mut state = self.state.lock();
        state.listener = Some(listener);
        state.headers = Some(headers);
        state.ops.push("start".to_string());
    }

    fn request(&self, count: u32) {
        self.state.lock().ops.push(format!("request({count})"));
    }

    fn set_message_compression(&self, enabled: bool) {
        self.state
            .lock()
            .ops
            .push(format!("set_compression({enabled})"));
    }

    fn send_message(&self, message: String) {
        let mut state = self.state.lock();
        state.ops.push(format!("send({message})"));
        state.sent.push(message);
    }

    fn half_close(&self) {
        self.state.lock().ops.push("half_close".to_string());
    }

    fn cancel(&self, message: &str, _cause: Option<anyhow::Error>) {
        self.state.lock().ops.push(format!("cancel({message})"));
    }
}

pub struct MockChannel {
    calls: Mutex<Vec<Arc<MockCall>>>,
    shut_down: AtomicBool,
}

impl MockChannel {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<Arc<MockCall>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl RawChannel<String, String> for MockChannel {
    fn new_call(&self, method: &str, _options: CallOptions) -> Arc<dyn RawCall<String, String>> {
        let call = Arc::new(MockCall::new(method));
        self.calls.lock().push(Arc::clone(&call));
        call
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

/// Factory-side view of everything the pool created.
pub struct MockTransport {
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(Vec::new()),
        })
    }

    pub fn factory(self: &Arc<Self>) -> ChannelFactory<String, String> {
        let transport = Arc::clone(self);
        Arc::new(move || {
            let channel = Arc::new(MockChannel::new());
            transport.channels.lock().push(Arc::clone(&channel));
            channel as Arc<dyn RawChannel<String, String>>
        })
    }

    pub fn channel(&self, index: usize) -> Arc<MockChannel> {
        Arc::clone(&self.channels.lock()[index])
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// All calls opened so far, in channel order then creation order.
    pub fn calls(&self) -> Vec<Arc<MockCall>> {
        self.channels
            .lock()
            .iter()
            .flat_map(|c| c.calls())
            .collect()
    }

    pub fn last_call(&self) -> Arc<MockCall> {
        self.calls().pop().expect("no call was opened")
    }
}

/// `key=<k>` carries affinity key `<k>`; anything else carries none.
pub fn key_extractor() -> KeyExtractor<String> {
    Arc::new(|message: &String, _path: &str| Ok(message.strip_prefix("key=").map(str::to_string)))
}

pub fn build_pool(
    transport: &Arc<MockTransport>,
    config_json: &str,
) -> PoolResult<Arc<ChannelPool<String, String>>> {
    ChannelPool::new(
        ApiConfig::from_json(config_json)?,
        transport.factory(),
        key_extractor(),
        key_extractor(),
    )
}

/// User-side listener that journals everything it sees.
pub struct RecordingListener {
    tag: String,
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingListener {
    pub fn new(tag: &str) -> (Self, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                tag: tag.to_string(),
                events: Arc::clone(&events),
            },
            events,
        )
    }
}

impl CallListener<String> for RecordingListener {
    fn on_headers(&mut self, headers: Metadata) {
        self.events
            .lock()
            .push(format!("{}:headers({})", self.tag, headers.len()));
    }

    fn on_message(&mut self, message: String) {
        self.events
            .lock()
            .push(format!("{}:message({message})", self.tag));
    }

    fn on_close(&mut self, status: Status, _trailers: Metadata) {
        self.events
            .lock()
            .push(format!("{}:close({:?})", self.tag, status.code));
    }

    fn on_ready(&mut self) {
        self.events.lock().push(format!("{}:ready", self.tag));
    }
}
