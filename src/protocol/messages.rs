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
use std::fmt::Debug;

use bytes::{BufMut, Bytes, BytesMut};

use super::command::CommandId;
use super::primary_types::{
    read_data, read_i64, read_string, read_string_map, read_u16, read_u32, read_u64, write_data,
    write_string, write_string_map,
};
use crate::network::Frame;
use crate::{AppError, AppResult};

/// A typed message with a fixed command id.
pub trait WireMessage: Sized + Debug {
    const COMMAND: CommandId;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()>;

    fn decode(buffer: &mut Bytes) -> AppResult<Self>;

    fn to_frame(&self) -> AppResult<Frame> {
        let mut writer = BytesMut::new();
        self.encode(&mut writer)?;
        Frame::new(Self::COMMAND.as_u16(), writer.freeze())
    }
}

/// Strip the trailing decimal digits of a module id: `gate12` -> `gate`.
pub fn module_type(module_id: &str) -> &str {
    module_id.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// Identity a module announces to the subnet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerInfo {
    pub module_id: String,
    pub address: String,
    pub ordinal: u32,
    pub version: u64,
}

impl PeerInfo {
    pub fn module_type(&self) -> &str {
        module_type(&self.module_id)
    }

    fn write(&self, writer: &mut BytesMut) -> AppResult<()> {
        write_string(writer, &self.module_id)?;
        write_string(writer, &self.address)?;
        writer.put_u32(self.ordinal);
        writer.put_u64(self.version);
        Ok(())
    }

    fn read(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(PeerInfo {
            module_id: read_string(buffer, "module_id")?,
            address: read_string(buffer, "address")?,
            ordinal: read_u32(buffer, "ordinal")?,
            version: read_u64(buffer, "version")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub text: String,
}

impl WireMessage for TestCommand {
    const COMMAND: CommandId = CommandId::Test;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        write_string(writer, &self.text)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(TestCommand {
            text: read_string(buffer, "text")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeTick {
    pub unix_millis: i64,
}

impl TimeTick {
    pub fn now() -> Self {
        TimeTick {
            unix_millis: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl WireMessage for TimeTick {
    const COMMAND: CommandId = CommandId::TimeTick;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        writer.put_i64(self.unix_millis);
        Ok(())
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(TimeTick {
            unix_millis: read_i64(buffer, "unix_millis")?,
        })
    }
}

/// First frame a dialer sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub info: PeerInfo,
    pub connect_priority: i64,
}

impl WireMessage for Login {
    const COMMAND: CommandId = CommandId::Login;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        self.info.write(writer)?;
        writer.put_i64(self.connect_priority);
        Ok(())
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(Login {
            info: PeerInfo::read(buffer)?,
            connect_priority: read_i64(buffer, "connect_priority")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginRetCode {
    Success = 0,
    /// the dialer presented an empty id or the acceptor's own id
    IdentityError = 1,
    /// another link already serves this module pair; do not retry
    DuplicateConnection = 2,
}

impl LoginRetCode {
    pub fn from_u16(value: u16) -> AppResult<Self> {
        match value {
            0 => Ok(LoginRetCode::Success),
            1 => Ok(LoginRetCode::IdentityError),
            2 => Ok(LoginRetCode::DuplicateConnection),
            other => Err(AppError::DecodeError(format!(
                "login ret code {} is unknown",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRet {
    pub code: LoginRetCode,
    /// the acceptor's own identity
    pub destination: PeerInfo,
}

impl WireMessage for LoginRet {
    const COMMAND: CommandId = CommandId::LoginRet;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        writer.put_u16(self.code as u16);
        self.destination.write(writer)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(LoginRet {
            code: LoginRetCode::from_u16(read_u16(buffer, "code")?)?,
            destination: PeerInfo::read(buffer)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logout {
    pub module_id: String,
}

impl WireMessage for Logout {
    const COMMAND: CommandId = CommandId::Logout;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        write_string(writer, &self.module_id)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(Logout {
            module_id: read_string(buffer, "module_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotifyAllInfo {
    pub peers: Vec<PeerInfo>,
}

impl WireMessage for NotifyAllInfo {
    const COMMAND: CommandId = CommandId::NotifyAllInfo;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        let count = u16::try_from(self.peers.len()).map_err(|_| {
            AppError::MessageTooLarge(format!("{} peers exceed u16", self.peers.len()))
        })?;
        writer.put_u16(count);
        for peer in &self.peers {
            peer.write(writer)?;
        }
        Ok(())
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        let count = read_u16(buffer, "peer_count")? as usize;
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            peers.push(PeerInfo::read(buffer)?);
        }
        Ok(NotifyAllInfo { peers })
    }
}

/// Module to module application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardToModule {
    pub from_module_id: String,
    pub to_module_id: String,
    pub msg_id: u16,
    pub data: Bytes,
}

impl WireMessage for ForwardToModule {
    const COMMAND: CommandId = CommandId::ForwardToModule;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        write_string(writer, &self.from_module_id)?;
        write_string(writer, &self.to_module_id)?;
        writer.put_u16(self.msg_id);
        write_data(writer, &self.data)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(ForwardToModule {
            from_module_id: read_string(buffer, "from_module_id")?,
            to_module_id: read_string(buffer, "to_module_id")?,
            msg_id: read_u16(buffer, "msg_id")?,
            data: read_data(buffer, "data")?,
        })
    }
}

/// A client message relayed by a gateway, carrying the client's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardFromGate {
    pub from_gate_id: String,
    pub to_module_id: String,
    pub client_conn_id: String,
    pub session: HashMap<String, String>,
    pub msg_id: u16,
    pub data: Bytes,
}

impl WireMessage for ForwardFromGate {
    const COMMAND: CommandId = CommandId::ForwardFromGate;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        write_string(writer, &self.from_gate_id)?;
        write_string(writer, &self.to_module_id)?;
        write_string(writer, &self.client_conn_id)?;
        write_string_map(writer, &self.session)?;
        writer.put_u16(self.msg_id);
        write_data(writer, &self.data)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(ForwardFromGate {
            from_gate_id: read_string(buffer, "from_gate_id")?,
            to_module_id: read_string(buffer, "to_module_id")?,
            client_conn_id: read_string(buffer, "client_conn_id")?,
            session: read_string_map(buffer, "session")?,
            msg_id: read_u16(buffer, "msg_id")?,
            data: read_data(buffer, "data")?,
        })
    }
}

/// A message for a client, relayed to the gateway holding its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardToClient {
    pub from_module_id: String,
    pub to_gate_id: String,
    pub to_client_id: String,
    pub msg_id: u16,
    pub data: Bytes,
}

impl WireMessage for ForwardToClient {
    const COMMAND: CommandId = CommandId::ForwardToClient;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        write_string(writer, &self.from_module_id)?;
        write_string(writer, &self.to_gate_id)?;
        write_string(writer, &self.to_client_id)?;
        writer.put_u16(self.msg_id);
        write_data(writer, &self.data)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(ForwardToClient {
            from_module_id: read_string(buffer, "from_module_id")?,
            to_gate_id: read_string(buffer, "to_gate_id")?,
            to_client_id: read_string(buffer, "to_client_id")?,
            msg_id: read_u16(buffer, "msg_id")?,
            data: read_data(buffer, "data")?,
        })
    }
}

/// Session state pushed to a module the session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    pub from_module_id: String,
    pub to_module_id: String,
    pub client_conn_id: String,
    pub session_uuid: String,
    pub session: HashMap<String, String>,
}

impl WireMessage for UpdateSession {
    const COMMAND: CommandId = CommandId::UpdateSession;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        write_string(writer, &self.from_module_id)?;
        write_string(writer, &self.to_module_id)?;
        write_string(writer, &self.client_conn_id)?;
        write_string(writer, &self.session_uuid)?;
        write_string_map(writer, &self.session)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(UpdateSession {
            from_module_id: read_string(buffer, "from_module_id")?,
            to_module_id: read_string(buffer, "to_module_id")?,
            client_conn_id: read_string(buffer, "client_conn_id")?,
            session_uuid: read_string(buffer, "session_uuid")?,
            session: read_string_map(buffer, "session")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerJoinedNotify {
    pub info: PeerInfo,
}

impl WireMessage for PeerJoinedNotify {
    const COMMAND: CommandId = CommandId::PeerJoinedNotify;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        self.info.write(writer)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(PeerJoinedNotify {
            info: PeerInfo::read(buffer)?,
        })
    }
}

/// Asks the receiving module to hand off its work and exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeQuitRequest {
    pub target_module_id: String,
}

impl WireMessage for SafeQuitRequest {
    const COMMAND: CommandId = CommandId::SafeQuitRequest;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        write_string(writer, &self.target_module_id)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(SafeQuitRequest {
            target_module_id: read_string(buffer, "target_module_id")?,
        })
    }
}

/// Asks a gateway to drop one of its client connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqCloseConnect {
    pub from_module_id: String,
    pub to_gate_id: String,
    pub client_conn_id: String,
}

impl WireMessage for ReqCloseConnect {
    const COMMAND: CommandId = CommandId::ReqCloseConnect;

    fn encode(&self, writer: &mut BytesMut) -> AppResult<()> {
        write_string(writer, &self.from_module_id)?;
        write_string(writer, &self.to_gate_id)?;
        write_string(writer, &self.client_conn_id)
    }

    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(ReqCloseConnect {
            from_module_id: read_string(buffer, "from_module_id")?,
            to_gate_id: read_string(buffer, "to_gate_id")?,
            client_conn_id: read_string(buffer, "client_conn_id")?,
        })
    }
}

/// Every message the subnet understands, as produced by the decode table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Test(TestCommand),
    TimeTick(TimeTick),
    Login(Login),
    LoginRet(LoginRet),
    Logout(Logout),
    NotifyAllInfo(NotifyAllInfo),
    ForwardToModule(ForwardToModule),
    ForwardFromGate(ForwardFromGate),
    ForwardToClient(ForwardToClient),
    UpdateSession(UpdateSession),
    PeerJoinedNotify(PeerJoinedNotify),
    SafeQuitRequest(SafeQuitRequest),
    ReqCloseConnect(ReqCloseConnect),
}

impl Message {
    pub fn command(&self) -> CommandId {
        match self {
            Message::Test(_) => CommandId::Test,
            Message::TimeTick(_) => CommandId::TimeTick,
            Message::Login(_) => CommandId::Login,
            Message::LoginRet(_) => CommandId::LoginRet,
            Message::Logout(_) => CommandId::Logout,
            Message::NotifyAllInfo(_) => CommandId::NotifyAllInfo,
            Message::ForwardToModule(_) => CommandId::ForwardToModule,
            Message::ForwardFromGate(_) => CommandId::ForwardFromGate,
            Message::ForwardToClient(_) => CommandId::ForwardToClient,
            Message::UpdateSession(_) => CommandId::UpdateSession,
            Message::PeerJoinedNotify(_) => CommandId::PeerJoinedNotify,
            Message::SafeQuitRequest(_) => CommandId::SafeQuitRequest,
            Message::ReqCloseConnect(_) => CommandId::ReqCloseConnect,
        }
    }

    pub fn is_control(&self) -> bool {
        self.command().is_control()
    }
}
