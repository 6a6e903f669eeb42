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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// transport errors
    #[error("connection is closed or shutting down")]
    Closed,

    #[error("outbound buffer is full")]
    BufferFull,

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// routing errors
    #[error("unknown peer module: {0}")]
    UnknownPeer(String),

    #[error("unknown client connection: {0}")]
    UnknownClient(String),

    #[error("decode error: {0}")]
    DecodeError(String),

    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Errors after which the byte stream can no longer be trusted.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            AppError::MalformedFrame(_)
                | AppError::IoError(_)
                | AppError::Closed
                | AppError::HandshakeTimeout
                | AppError::HandshakeRejected(_)
        )
    }
}
