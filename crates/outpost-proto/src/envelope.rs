//! Envelope: the framed unit exchanged between controller and agent

use crate::codec::CodecError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A typed message with an opaque body.
///
/// `id` correlates a request with its reply and is empty for unsolicited
/// traffic. `kind` tells collaborators how to read `data`; the transport
/// layer never looks inside `data` except for tunnel traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub kind: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub error: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            data,
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Build an envelope whose body is the serialized `payload`
    pub fn request<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Self, CodecError> {
        let data = bincode::serialize(payload)?;
        Ok(Self::new(kind.as_str(), data))
    }

    /// Build a reply carrying the same correlation id and kind as `request`
    pub fn reply<T: Serialize>(request: &Envelope, payload: &T) -> Result<Self, CodecError> {
        let data = bincode::serialize(payload)?;
        Ok(Self {
            id: request.id.clone(),
            kind: request.kind.clone(),
            data,
            error: None,
        })
    }

    /// Build a failure reply for `request`
    pub fn error_reply(request: &Envelope, error: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            kind: request.kind.clone(),
            data: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Deserialize the body as `T`
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(bincode::deserialize(&self.data)?)
    }

    pub fn message_kind(&self) -> Option<MessageKind> {
        self.kind.parse().ok()
    }

    pub fn is_tunnel(&self) -> bool {
        self.kind == MessageKind::TunnelData.as_str()
    }
}

/// Message kinds understood by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Register,
    Ping,
    ProcessList,
    DirList,
    Cd,
    Pwd,
    Download,
    Upload,
    Kill,
    Task,
    RemoteTask,
    TunnelData,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::Register,
        MessageKind::Ping,
        MessageKind::ProcessList,
        MessageKind::DirList,
        MessageKind::Cd,
        MessageKind::Pwd,
        MessageKind::Download,
        MessageKind::Upload,
        MessageKind::Kill,
        MessageKind::Task,
        MessageKind::RemoteTask,
        MessageKind::TunnelData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Register => "register",
            MessageKind::Ping => "ping",
            MessageKind::ProcessList => "ps",
            MessageKind::DirList => "ls",
            MessageKind::Cd => "cd",
            MessageKind::Pwd => "pwd",
            MessageKind::Download => "download",
            MessageKind::Upload => "upload",
            MessageKind::Kill => "kill",
            MessageKind::Task => "task",
            MessageKind::RemoteTask => "remote-task",
            MessageKind::TunnelData => "tunnel-data",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown message kind: {}", s))
    }
}

// bincode writes byte slices as length + raw bytes instead of a sequence of u8
pub(crate) mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
