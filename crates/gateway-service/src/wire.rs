//! Frame formats of the control link and the local control socket.
//!
//! Outbound control frames are `one:<Kind>:...` text lines; inbound server
//! commands and local commands are JSON objects.

use crate::errors::GatewayError;
use crate::models::DeviceView;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Who asked for something over the control link. Events produced while
/// serving the request carry it back so the reply reaches the asker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRef {
    pub from: u64,
    pub name: String,
}

/// Command received from the control server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerCommand {
    #[serde(default)]
    pub from: u64,
    pub name: String,
    #[serde(default)]
    pub content: Value,
}

impl ServerCommand {
    pub fn parse(frame: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(frame)
            .map_err(|e| GatewayError::Protocol(format!("malformed server command: {e}")))
    }

    pub fn kind(&self) -> ServerCommandKind {
        ServerCommandKind::from_name(&self.name)
    }

    pub fn request(&self) -> RequestRef {
        RequestRef {
            from: self.from,
            name: self.name.clone(),
        }
    }

    /// The content as a bare string: JSON strings lose their quotes, other
    /// values are rendered as JSON text.
    pub fn value(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Decode the content as `T`, accepting either an embedded JSON value or
    /// a JSON document carried inside a string.
    pub fn decode_content<T: serde::de::DeserializeOwned>(&self) -> Result<T, GatewayError> {
        let decoded = match &self.content {
            Value::String(s) => serde_json::from_str(s),
            other => serde_json::from_value(other.clone()),
        };
        decoded.map_err(|e| GatewayError::Protocol(format!("cannot parse {}: {e}", self.name)))
    }
}

/// Known server command names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommandKind {
    GetIpcams,
    ManageGetIpcam,
    ManageSetIpcam,
    ManageDelIpcam,
    ManageReconnectIpcam,
    CreateSignalingConnection,
    LoginOk,
    LoginFailed,
    ViewerJoined,
    SetRoomToken,
    BadRegToken,
    RegError,
    Unknown,
}

impl ServerCommandKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "GetIpcams" => Self::GetIpcams,
            "ManageGetIpcam" => Self::ManageGetIpcam,
            "ManageSetIpcam" => Self::ManageSetIpcam,
            "ManageDelIpcam" => Self::ManageDelIpcam,
            "ManageReconnectIpcam" => Self::ManageReconnectIpcam,
            "CreateSignalingConnection" => Self::CreateSignalingConnection,
            "LoginOk" | "LoginAddrOk" => Self::LoginOk,
            "LoginAddrError" | "BadRoomToken" => Self::LoginFailed,
            "Broadcast" | "UserOnline" => Self::ViewerJoined,
            "SetRoomToken" => Self::SetRoomToken,
            "BadRegToken" => Self::BadRegToken,
            "RegError" => Self::RegError,
            _ => Self::Unknown,
        }
    }
}

/// `one:Login:<token>`
pub fn login_frame(token: &str) -> String {
    format!("one:Login:{token}")
}

/// `one:Ipcams:<json array of view records>`
pub fn devices_frame(views: &[DeviceView]) -> String {
    let body = serde_json::to_string(views).unwrap_or_else(|_| "[]".to_string());
    format!("one:Ipcams:{body}")
}

/// Typed reply to one requester.
pub fn response_frame(to: u64, kind: &str, content: Value) -> String {
    let body = json!({
        "type": "Response",
        "content": { "type": kind, "content": content },
    });
    format!("one:ResponseToMany:{to}:{body}")
}

/// Plain-text reply to one requester.
pub fn info_frame(to: u64, message: &str) -> String {
    let body = json!({ "type": "Info", "content": message });
    format!("one:ResponseToMany:{to}:{body}")
}

/// `one:RegRoom:<reg token>:<room name as JSON>`
pub fn reg_room_frame(token: &str, name: &Value) -> String {
    format!("one:RegRoom:{token}:{name}")
}

/// `one:RemoveRoom:`
pub fn remove_room_frame() -> String {
    "one:RemoveRoom:".to_string()
}

/// Announces that a device changed its id.
pub fn id_changed_frame(old: &str, new: &str) -> String {
    let body = json!({ "old": old, "new": new });
    format!("one:IpcamIdChanged:{body}")
}

/// Connectivity status shown to local clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Connecting,
    LoggingIn,
    Ready,
    Unreachable,
    AuthFailed,
    BadServerMsg,
    Disconnected,
    BadRoomToken,
    SaveRoomTokenError,
    Regging,
    RegError,
}

impl Status {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Connecting => "connecting",
            Status::LoggingIn => "logging_in",
            Status::Ready => "ready",
            Status::Unreachable => "unreachable",
            Status::AuthFailed => "auth_failed",
            Status::BadServerMsg => "bad_server_msg",
            Status::Disconnected => "disconnected",
            Status::BadRoomToken => "bad_room_token",
            Status::SaveRoomTokenError => "save_room_token_error",
            Status::Regging => "regging",
            Status::RegError => "reg_error",
        }
    }

    /// `{"type":"Status","content":"<status>"}`
    pub fn to_frame(self) -> String {
        json!({ "type": "Status", "content": self.as_str() }).to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the gateway holds a usable registration token. Sent to local
/// clients as a notice; it never replaces the connectivity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regable {
    Regable,
    BadRegToken,
    SaveRegTokenError,
}

impl Regable {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Regable::Regable => "regable",
            Regable::BadRegToken => "bad_reg_token",
            Regable::SaveRegTokenError => "save_reg_token_error",
        }
    }

    /// `{"type":"Regable","content":"<state>"}`
    pub fn to_frame(self) -> String {
        json!({ "type": "Regable", "content": self.as_str() }).to_string()
    }
}

/// Command sent by a local client over the local control socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalCommand {
    #[serde(rename = "type")]
    pub kind: LocalCommandKind,
    #[serde(default)]
    pub content: Value,
}

impl LocalCommand {
    pub fn parse(frame: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(frame)
            .map_err(|e| GatewayError::Protocol(format!("malformed local command: {e}")))
    }

    pub fn value(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LocalCommandKind {
    GetStatus,
    GetRoomInfo,
    GetCameras,
    SetRecOn,
    SetRecOff,
    DoConnect,
    DoLogin,
    GetRegable,
    SetRegToken,
    DoRemoveRegToken,
    DoRegRoom,
    DoRemoveRoom,
    Close,
    Exit,
}

/// `{"type":"Rec","camera":<record>,"ids":[...]}`
pub fn recording_notice(camera: &crate::models::DeviceRecord, ids: &[String]) -> String {
    json!({ "type": "Rec", "camera": camera, "ids": ids }).to_string()
}

/// `{"type":"RoomInfo","content":{"pid":..,"id":..}}`
pub fn room_info_notice(gateway_id: &str) -> String {
    json!({
        "type": "RoomInfo",
        "content": { "pid": std::process::id(), "id": gateway_id },
    })
    .to_string()
}

/// Error frame sent on a signaling socket.
pub fn signaling_error(message: &str) -> String {
    json!({ "error": message }).to_string()
}
