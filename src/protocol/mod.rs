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

//! Subnet message catalog.
//!
//! - `CommandId`: the command carried in every frame header
//! - `WireMessage`: typed payload encoding, one struct per command
//! - `DecodeTable`: command id to decoder lookup used by the receive path

mod command;
mod decode_table;
mod messages;
mod primary_types;

pub use command::CommandId;
pub use decode_table::DecodeTable;
pub use messages::{
    module_type, ForwardFromGate, ForwardToClient, ForwardToModule, Login, LoginRet,
    LoginRetCode, Logout, Message, NotifyAllInfo, PeerInfo, PeerJoinedNotify, ReqCloseConnect,
    SafeQuitRequest, TestCommand, TimeTick, UpdateSession, WireMessage,
};
