// Copyright 2025 jonefeewang@gmail.com
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

use crate::network::ConnectionId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// transfer faults
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("stream closed after {transferred} of {expected} bytes")]
    StreamClosed { transferred: usize, expected: usize },

    #[error("connection {0} closed")]
    ConnectionClosed(ConnectionId),

    #[error("write queue of connection {0} is full")]
    WriteQueueFull(ConnectionId),

    /// protocol faults
    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// registry faults
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// lifecycle misuse
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("server stopped")]
    ServerStopped,

    #[error("Accept error = {0}")]
    Accept(String),

    /// general errors
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingSetup(String),
}

impl AppError {
    /// Whether the fault came from the byte stream itself rather than from
    /// misuse or configuration.
    pub fn is_transfer_fault(&self) -> bool {
        matches!(
            self,
            AppError::IoError(_) | AppError::StreamClosed { .. } | AppError::ConnectionClosed(_)
        )
    }
}
