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

use std::time::Duration;

/// Default cap on the number of channels a pool will open.
pub const DEFAULT_MAX_SIZE: usize = 10;

/// Default per-channel stream count below which the pool reuses an existing
/// channel instead of opening a new one.
pub const DEFAULT_STREAMS_LOW_WATERMARK: usize = 100;

/// Upper bound on how long an operation waits for a concurrent first send to
/// finish. The first-send routine is straight-line code, so expiry means the
/// sender died mid-routine.
pub const FIRST_SEND_WAIT: Duration = Duration::from_secs(20);
