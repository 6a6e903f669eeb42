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

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use super::messages::{
    ForwardFromGate, ForwardToClient, ForwardToModule, Login, LoginRet, Logout, Message,
    NotifyAllInfo, PeerJoinedNotify, ReqCloseConnect, SafeQuitRequest, TestCommand, TimeTick,
    UpdateSession, WireMessage,
};
use crate::network::InboundFrame;
use crate::{AppError, AppResult};

type DecodeFn = Box<dyn Fn(Bytes) -> AppResult<Message> + Send + Sync>;

/// Maps a command id to the decoder of its payload.
pub struct DecodeTable {
    decoders: HashMap<u16, DecodeFn>,
}

impl DecodeTable {
    pub fn empty() -> Self {
        DecodeTable {
            decoders: HashMap::new(),
        }
    }

    /// Table holding every built-in subnet message.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register::<TestCommand>(Message::Test);
        table.register::<TimeTick>(Message::TimeTick);
        table.register::<Login>(Message::Login);
        table.register::<LoginRet>(Message::LoginRet);
        table.register::<Logout>(Message::Logout);
        table.register::<NotifyAllInfo>(Message::NotifyAllInfo);
        table.register::<ForwardToModule>(Message::ForwardToModule);
        table.register::<ForwardFromGate>(Message::ForwardFromGate);
        table.register::<ForwardToClient>(Message::ForwardToClient);
        table.register::<UpdateSession>(Message::UpdateSession);
        table.register::<PeerJoinedNotify>(Message::PeerJoinedNotify);
        table.register::<SafeQuitRequest>(Message::SafeQuitRequest);
        table.register::<ReqCloseConnect>(Message::ReqCloseConnect);
        table
    }

    pub fn register<M>(&mut self, wrap: fn(M) -> Message)
    where
        M: WireMessage + 'static,
    {
        self.decoders.insert(
            M::COMMAND.as_u16(),
            Box::new(move |mut payload| M::decode(&mut payload).map(wrap)),
        );
    }

    pub fn decode(&self, frame: InboundFrame) -> AppResult<Message> {
        let decoder = self.decoders.get(&frame.cmd_id).ok_or_else(|| {
            AppError::DecodeError(format!("no decoder for command {}", frame.cmd_id))
        })?;
        decoder(frame.payload)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl fmt::Debug for DecodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.decoders.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("DecodeTable").field("commands", &ids).finish()
    }
}
