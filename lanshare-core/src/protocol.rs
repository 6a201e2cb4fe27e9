//! Wire protocol: the JSON message envelope, its typed `data` payloads, and discovery datagrams.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::{self, CryptoError, PublicKey, SessionKey};

/// Recipient used for messages addressed to every peer.
pub const BROADCAST_RECIPIENT: &str = "all";

/// Envelope discriminator, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Handshake,
    HandshakeResponse,
    FileRequest,
    FileResponse,
    FileChunk,
    FileCancel,
    UpdateName,
}

/// Chat flavour carried in `messageType`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    #[default]
    Text,
    Image,
    File,
    Reply,
}

/// One TCP message. When `encrypted` is set, `content` is empty and `nonce`/`ciphertext`
/// come from a single seal call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub nonce: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub ciphertext: Option<Vec<u8>>,
    /// Raw sub-payload; decode through [`Message::payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<ChatKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

/// Typed view of a message's `data`, selected by its `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Chat,
    Handshake(HandshakeInfo),
    HandshakeResponse(HandshakeInfo),
    FileRequest(FileRequest),
    FileResponse(FileResponse),
    FileChunk(FileChunk),
    FileCancel(FileCancel),
    UpdateName,
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Chat => MessageKind::Chat,
            Payload::Handshake(_) => MessageKind::Handshake,
            Payload::HandshakeResponse(_) => MessageKind::HandshakeResponse,
            Payload::FileRequest(_) => MessageKind::FileRequest,
            Payload::FileResponse(_) => MessageKind::FileResponse,
            Payload::FileChunk(_) => MessageKind::FileChunk,
            Payload::FileCancel(_) => MessageKind::FileCancel,
            Payload::UpdateName => MessageKind::UpdateName,
        }
    }

    fn to_data(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        let value = match self {
            Payload::Chat | Payload::UpdateName => return Ok(None),
            Payload::Handshake(info) | Payload::HandshakeResponse(info) => {
                serde_json::to_value(info)?
            }
            Payload::FileRequest(req) => serde_json::to_value(req)?,
            Payload::FileResponse(resp) => serde_json::to_value(resp)?,
            Payload::FileChunk(chunk) => serde_json::to_value(chunk)?,
            Payload::FileCancel(cancel) => serde_json::to_value(cancel)?,
        };
        Ok(Some(value))
    }
}

/// Handshake data: the sender's persistent public key, display name and listening port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInfo {
    pub public_key: PublicKey,
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub file_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub message: String,
}

/// Explicit cancel. `failed` distinguishes an error on the far side from a user cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCancel {
    pub file_id: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub reason: String,
}

/// One slice of a file. Either `data` (plaintext) or `nonce` + `ciphertext` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: String,
    /// 1-based sequence number.
    pub chunk_num: u32,
    pub total_chunks: u32,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub nonce: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub ciphertext: Option<Vec<u8>>,
}

impl FileChunk {
    /// Chunk whose bytes are sealed with the peer's session key.
    pub fn sealed(
        file_id: &str,
        chunk_num: u32,
        total_chunks: u32,
        key: &SessionKey,
        bytes: &[u8],
    ) -> Result<Self, CryptoError> {
        let sealed = identity::seal(key, bytes)?;
        Ok(FileChunk {
            file_id: file_id.to_string(),
            chunk_num,
            total_chunks,
            encrypted: true,
            data: None,
            nonce: Some(sealed.nonce.to_vec()),
            ciphertext: Some(sealed.ciphertext),
        })
    }

    pub fn plain(file_id: &str, chunk_num: u32, total_chunks: u32, bytes: Vec<u8>) -> Self {
        FileChunk {
            file_id: file_id.to_string(),
            chunk_num,
            total_chunks,
            encrypted: false,
            data: Some(bytes),
            nonce: None,
            ciphertext: None,
        }
    }

    /// Recover the chunk bytes. An encrypted chunk needs `key`.
    pub fn open(&self, key: Option<&SessionKey>) -> Result<Vec<u8>, ProtocolError> {
        if !self.encrypted {
            return Ok(self.data.clone().unwrap_or_default());
        }
        let key = key.ok_or(ProtocolError::MissingKey)?;
        let (nonce, ciphertext) = sealed_parts(&self.nonce, &self.ciphertext)?;
        Ok(identity::open(key, ciphertext, nonce)?)
    }
}

fn sealed_parts<'a>(
    nonce: &'a Option<Vec<u8>>,
    ciphertext: &'a Option<Vec<u8>>,
) -> Result<(&'a [u8], &'a [u8]), ProtocolError> {
    match (nonce.as_deref(), ciphertext.as_deref()) {
        (Some(n), Some(c)) if !n.is_empty() && !c.is_empty() => Ok((n, c)),
        _ => Err(ProtocolError::IncompleteCiphertext),
    }
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: Payload,
    ) -> Result<Self, ProtocolError> {
        Ok(Message {
            kind: payload.kind(),
            from: from.into(),
            to: to.into(),
            content: String::new(),
            timestamp: Some(Utc::now()),
            encrypted: false,
            nonce: None,
            ciphertext: None,
            data: payload.to_data().map_err(ProtocolError::Encode)?,
            message_id: None,
            message_type: None,
            reply_to_id: None,
        })
    }

    /// Plaintext text chat with a fresh message ID.
    pub fn chat(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Message {
            kind: MessageKind::Chat,
            from: from.into(),
            to: to.into(),
            content: text.into(),
            timestamp: Some(Utc::now()),
            encrypted: false,
            nonce: None,
            ciphertext: None,
            data: None,
            message_id: Some(generate_message_id()),
            message_type: Some(ChatKind::Text),
            reply_to_id: None,
        }
    }

    /// Rename notice; the new display name travels in `content`.
    pub fn update_name(from: impl Into<String>, new_name: impl Into<String>) -> Self {
        Message {
            kind: MessageKind::UpdateName,
            from: from.into(),
            to: BROADCAST_RECIPIENT.to_string(),
            content: new_name.into(),
            timestamp: Some(Utc::now()),
            encrypted: false,
            nonce: None,
            ciphertext: None,
            data: None,
            message_id: None,
            message_type: None,
            reply_to_id: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty() || self.to == BROADCAST_RECIPIENT
    }

    /// Decode `data` according to `kind`.
    pub fn payload(&self) -> Result<Payload, ProtocolError> {
        Ok(match self.kind {
            MessageKind::Chat => Payload::Chat,
            MessageKind::UpdateName => Payload::UpdateName,
            MessageKind::Handshake => Payload::Handshake(self.data_as()?),
            MessageKind::HandshakeResponse => Payload::HandshakeResponse(self.data_as()?),
            MessageKind::FileRequest => Payload::FileRequest(self.data_as()?),
            MessageKind::FileResponse => Payload::FileResponse(self.data_as()?),
            MessageKind::FileChunk => Payload::FileChunk(self.data_as()?),
            MessageKind::FileCancel => Payload::FileCancel(self.data_as()?),
        })
    }

    fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = self
            .data
            .as_ref()
            .ok_or(ProtocolError::MissingData(self.kind))?;
        T::deserialize(data).map_err(|e| ProtocolError::InvalidData(self.kind, e))
    }

    /// Replace `content` with its sealed form.
    pub fn seal_content(&mut self, key: &SessionKey) -> Result<(), CryptoError> {
        let sealed = identity::seal(key, self.content.as_bytes())?;
        self.content.clear();
        self.encrypted = true;
        self.nonce = Some(sealed.nonce.to_vec());
        self.ciphertext = Some(sealed.ciphertext);
        Ok(())
    }

    /// Plaintext content, decrypting with `key` when the message is encrypted.
    pub fn open_content(&self, key: Option<&SessionKey>) -> Result<String, ProtocolError> {
        if !self.encrypted {
            return Ok(self.content.clone());
        }
        let key = key.ok_or(ProtocolError::MissingKey)?;
        let (nonce, ciphertext) = sealed_parts(&self.nonce, &self.ciphertext)?;
        let plain = identity::open(key, ciphertext, nonce)?;
        String::from_utf8(plain).map_err(|_| ProtocolError::Utf8)
    }
}

/// Random message ID for chat messages.
pub fn generate_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    Announce,
    Response,
}

/// UDP discovery datagram. Unauthenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_key: Option<PublicKey>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{0:?} message without data")]
    MissingData(MessageKind),
    #[error("invalid {0:?} data: {1}")]
    InvalidData(MessageKind, #[source] serde_json::Error),
    #[error("encode data: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("encrypted message without nonce or ciphertext")]
    IncompleteCiphertext,
    #[error("encrypted payload but no shared key")]
    MissingKey,
    #[error("decrypted content is not utf-8")]
    Utf8,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
