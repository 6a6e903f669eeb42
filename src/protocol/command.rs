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

use crate::{AppError, AppResult};

/// Command ids carried in the first two bytes of every subnet frame.
///
/// Control commands (`Test` .. `NotifyAllInfo`) concern liveness and
/// membership. They are handled on the receive path of the connection and
/// never wait behind application traffic in a lane. Everything from
/// `ForwardToModule` on is routing traffic and goes through the lanes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandId {
    Test = 1,
    TimeTick = 2,
    Login = 3,
    LoginRet = 4,
    Logout = 5,
    NotifyAllInfo = 6,
    ForwardToModule = 16,
    ForwardFromGate = 17,
    ForwardToClient = 18,
    UpdateSession = 19,
    PeerJoinedNotify = 20,
    SafeQuitRequest = 21,
    ReqCloseConnect = 22,
}

impl CommandId {
    pub fn from_u16(value: u16) -> AppResult<Self> {
        match value {
            1 => Ok(CommandId::Test),
            2 => Ok(CommandId::TimeTick),
            3 => Ok(CommandId::Login),
            4 => Ok(CommandId::LoginRet),
            5 => Ok(CommandId::Logout),
            6 => Ok(CommandId::NotifyAllInfo),
            16 => Ok(CommandId::ForwardToModule),
            17 => Ok(CommandId::ForwardFromGate),
            18 => Ok(CommandId::ForwardToClient),
            19 => Ok(CommandId::UpdateSession),
            20 => Ok(CommandId::PeerJoinedNotify),
            21 => Ok(CommandId::SafeQuitRequest),
            22 => Ok(CommandId::ReqCloseConnect),
            invalid => Err(AppError::DecodeError(format!(
                "command id:{} is unknown",
                invalid
            ))),
        }
    }

    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    pub const fn is_control(&self) -> bool {
        matches!(
            self,
            CommandId::Test
                | CommandId::TimeTick
                | CommandId::Login
                | CommandId::LoginRet
                | CommandId::Logout
                | CommandId::NotifyAllInfo
        )
    }
}
