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

//! Session-affinity routing over an in-process transport.
//!
//! A `CreateSession` call is BIND-configured: the session name in its
//! response is bound to whichever channel carried the call. Subsequent
//! `GetSession` calls are BOUND-configured and ride the same channel, while
//! plain calls spread least-busy across the pool.
//!
//! Messages are strings; `key=<name>` carries the affinity key `<name>`.
//!
//! Run with: `cargo run --example keyed_router`

use env_logger::Env;
use log::info;
use managed_channel_pool::{
    ApiConfig, CallListener, CallOptions, ChannelPool, Metadata, RawCall, RawChannel, Status,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

static SESSION_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A call served entirely in process: `half_close` triggers the "server"
/// response and the final status.
struct InProcessCall {
    method: String,
    listener: Mutex<Option<Box<dyn CallListener<String>>>>,
    last_sent: Mutex<Option<String>>,
}

impl RawCall<String, String> for InProcessCall {
    fn start(&self, listener: Box<dyn CallListener<String>>, _headers: Metadata) {
        *self.listener.lock() = Some(listener);
    }

    fn request(&self, _count: u32) {}

    fn set_message_compression(&self, _enabled: bool) {}

    fn send_message(&self, message: String) {
        *self.last_sent.lock() = Some(message);
    }

    fn half_close(&self) {
        let mut listener = self.listener.lock();
        let Some(listener) = listener.as_mut() else {
            return;
        };
        let response = match self.method.as_str() {
            "/demo.Sessions/CreateSession" => {
                let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
                format!("key=sessions/{seq}")
            }
            _ => {
                let request = self.last_sent.lock().clone().unwrap_or_default();
                format!("echo:{request}")
            }
        };
        listener.on_message(response);
        listener.on_close(Status::ok(), Metadata::new());
    }

    fn cancel(&self, message: &str, _cause: Option<anyhow::Error>) {
        if let Some(listener) = self.listener.lock().as_mut() {
            listener.on_close(
                Status::new(managed_channel_pool::StatusCode::Cancelled, message),
                Metadata::new(),
            );
        }
    }
}

struct InProcessChannel;

impl RawChannel<String, String> for InProcessChannel {
    fn new_call(&self, method: &str, _options: CallOptions) -> Arc<dyn RawCall<String, String>> {
        Arc::new(InProcessCall {
            method: method.to_string(),
            listener: Mutex::new(None),
            last_sent: Mutex::new(None),
        })
    }
}

struct LogListener {
    tag: String,
    session: Arc<Mutex<Option<String>>>,
}

impl CallListener<String> for LogListener {
    fn on_message(&mut self, message: String) {
        info!("{}: response {message}", self.tag);
        if let Some(name) = message.strip_prefix("key=") {
            *self.session.lock() = Some(name.to_string());
        }
    }

    fn on_close(&mut self, status: Status, _trailers: Metadata) {
        info!("{}: closed with {:?}", self.tag, status.code);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("debug"))
        .format_timestamp(None)
        .init();

    let config = ApiConfig::from_json(
        r#"{
            "channelPool": { "maxSize": 3, "maxConcurrentStreamsLowWatermark": 2 },
            "method": [
                { "name": ["/demo.Sessions/CreateSession"],
                  "affinity": { "command": "BIND", "affinityKey": "name" } },
                { "name": ["/demo.Sessions/GetSession"],
                  "affinity": { "command": "BOUND", "affinityKey": "name" } },
                { "name": ["/demo.Sessions/DeleteSession"],
                  "affinity": { "command": "UNBIND", "affinityKey": "name" } }
            ]
        }"#,
    )?;

    let pool = ChannelPool::new(
        config,
        Arc::new(|| Arc::new(InProcessChannel) as Arc<dyn RawChannel<String, String>>),
        Arc::new(|message: &String, _path: &str| {
            Ok(message.strip_prefix("key=").map(str::to_string))
        }),
        Arc::new(|message: &String, _path: &str| {
            Ok(message.strip_prefix("key=").map(str::to_string))
        }),
    )?;

    // Create a session; its response key gets bound to the carrying channel.
    let session = Arc::new(Mutex::new(None));
    let create = pool.new_call("/demo.Sessions/CreateSession", CallOptions::default())?;
    create.start(
        Box::new(LogListener {
            tag: "create".to_string(),
            session: Arc::clone(&session),
        }),
        Metadata::new(),
    );
    create.send_message("create".to_string()).await?;
    create.half_close().await?;

    let session = session.lock().clone().expect("no session was created");
    info!("session {session} bound, affinity keys: {}", pool.affinity_key_count());

    // Every follow-up for this session rides the bound channel.
    for i in 0..4 {
        let get = pool.new_call("/demo.Sessions/GetSession", CallOptions::default())?;
        get.start(
            Box::new(LogListener {
                tag: format!("get-{i}"),
                session: Arc::new(Mutex::new(None)),
            }),
            Metadata::new(),
        );
        get.send_message(format!("key={session}")).await?;
        get.half_close().await?;
    }

    // Plain calls spread least-busy and grow the pool past the watermark.
    let mut open = Vec::new();
    for i in 0..6 {
        let call = pool.new_call("/demo.Status/Check", CallOptions::default())?;
        call.start(
            Box::new(LogListener {
                tag: format!("check-{i}"),
                session: Arc::new(Mutex::new(None)),
            }),
            Metadata::new(),
        );
        call.send_message("ping".to_string()).await?;
        open.push(call);
    }

    info!(
        "pool metrics: {}",
        serde_json::to_string_pretty(&pool.metrics())?
    );

    // Tear the session down; the binding goes with it.
    let delete = pool.new_call("/demo.Sessions/DeleteSession", CallOptions::default())?;
    delete.start(
        Box::new(LogListener {
            tag: "delete".to_string(),
            session: Arc::new(Mutex::new(None)),
        }),
        Metadata::new(),
    );
    delete.send_message(format!("key={session}")).await?;
    delete.half_close().await?;
    info!("affinity keys after delete: {}", pool.affinity_key_count());

    pool.shutdown();
    Ok(())
}
