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

use thiserror::Error;

/// Errors surfaced by the pool and its call facades.
///
/// Transport failures are not represented here: they travel unchanged
/// through the call listener's `on_close`.
#[derive(Error, Debug)]
pub enum PoolError {
    /// An operation was invoked in a call state that does not permit it.
    /// This is a programmer error and is never retried by the pool.
    #[error("invalid call state: {0}")]
    InvalidState(&'static str),

    /// A blocked operation gave up waiting for the first send to complete.
    /// The operation was not forwarded; the call is effectively abandoned.
    #[error("interrupted while waiting for the first send to complete")]
    WaitInterrupted,

    /// The pool configuration was rejected at construction.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The pool has been shut down and no longer creates calls.
    #[error("channel pool is shut down")]
    Shutdown,
}

pub type PoolResult<T> = Result<T, PoolError>;
