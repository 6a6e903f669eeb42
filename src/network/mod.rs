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

//! Network module for the subnet transport
//!
//! - `FramedConnection`: non-blocking enqueue plus a batching outbound pump
//! - `FrameCodec`: length-prefixed frame decoding for the read side
//! - `PayloadCipher`: optional payload encryption hook

pub use cipher::PayloadCipher;
pub use connection::{
    attach_stream, split_stream, FrameReader, FramedConnection, MAX_BATCH_FRAMES,
};
pub use frame::{Frame, FrameCodec, InboundFrame, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
mod cipher;
mod connection;
mod frame;
