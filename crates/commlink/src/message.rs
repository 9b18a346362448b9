//! Call and reply envelopes.
//!
//! Both messages travel as two frames:
//!
//! ```text
//! [JSON header][body bytes]
//! ```
//!
//! The header carries routing and auth metadata; the body is opaque to the
//! transport.

use crate::error::{CommError, Result};
use crate::status::ReplyStatus;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Multi-part transport message.
pub type Multipart = Vec<Bytes>;

/// Object id of the well-known root object on every server.
pub const ROOT_OBJECT_ID: u64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CallHeader {
    object_id: u64,
    method: String,
    #[serde(default)]
    command_id: u64,
    #[serde(default)]
    auth: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplyHeader {
    status: ReplyStatus,
    #[serde(default)]
    auth: Vec<String>,
}

/// A method call on a remote object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMessage {
    pub object_id: u64,
    pub method: String,
    /// Client-assigned id used to target cancellation; 0 when untracked.
    pub command_id: u64,
    pub body: Bytes,
    pub auth: Vec<String>,
}

impl CallMessage {
    pub fn new(object_id: u64, method: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            object_id,
            method: method.into(),
            command_id: 0,
            body: body.into(),
            auth: Vec::new(),
        }
    }

    /// Build a call whose body is the JSON encoding of `params`.
    pub fn json<T: Serialize>(object_id: u64, method: impl Into<String>, params: &T) -> Result<Self> {
        let body = serde_json::to_vec(params)?;
        Ok(Self::new(object_id, method, body))
    }

    pub fn bodylen(&self) -> usize {
        self.body.len()
    }

    /// Drop all content. Used when a call is abandoned.
    pub fn clear(&mut self) {
        self.object_id = ROOT_OBJECT_ID;
        self.method.clear();
        self.command_id = 0;
        self.body = Bytes::new();
        self.auth.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.method.is_empty() && self.body.is_empty()
    }

    pub fn to_frames(&self) -> Result<Multipart> {
        let header = CallHeader {
            object_id: self.object_id,
            method: self.method.clone(),
            command_id: self.command_id,
            auth: self.auth.clone(),
        };
        Ok(vec![Bytes::from(serde_json::to_vec(&header)?), self.body.clone()])
    }

    pub fn from_frames(frames: &[Bytes]) -> Result<Self> {
        let (header, body) = split_two(frames, "call")?;
        let header: CallHeader = serde_json::from_slice(header).map_err(|e| CommError::BadMessage {
            message: format!("Invalid call header: {}", e),
        })?;
        Ok(Self {
            object_id: header.object_id,
            method: header.method,
            command_id: header.command_id,
            body: body.clone(),
            auth: header.auth,
        })
    }
}

/// The reply to a [`CallMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMessage {
    pub status: ReplyStatus,
    pub body: Bytes,
    pub auth: Vec<String>,
}

impl ReplyMessage {
    pub fn new(status: ReplyStatus, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            auth: Vec::new(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(ReplyStatus::Ok, body)
    }

    /// A reply carrying only a status, synthesized for failed calls.
    pub fn failure(status: ReplyStatus) -> Self {
        Self::new(status, Bytes::new())
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::ok(serde_json::to_vec(value)?))
    }

    /// Decode the body as JSON.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| CommError::BadMessage {
            message: format!("Invalid reply body: {}", e),
        })
    }

    pub fn to_frames(&self) -> Result<Multipart> {
        let header = ReplyHeader {
            status: self.status,
            auth: self.auth.clone(),
        };
        Ok(vec![Bytes::from(serde_json::to_vec(&header)?), self.body.clone()])
    }

    pub fn from_frames(frames: &[Bytes]) -> Result<Self> {
        let (header, body) = split_two(frames, "reply")?;
        let header: ReplyHeader = serde_json::from_slice(header).map_err(|e| CommError::BadMessage {
            message: format!("Invalid reply header: {}", e),
        })?;
        Ok(Self {
            status: header.status,
            body: body.clone(),
            auth: header.auth,
        })
    }

    /// Turn a non-OK reply into an error.
    pub fn into_result(self) -> Result<Self> {
        if self.status.is_ok() {
            Ok(self)
        } else {
            Err(CommError::from_status(self.status, &self.body))
        }
    }
}

fn split_two<'a>(frames: &'a [Bytes], what: &str) -> Result<(&'a Bytes, &'a Bytes)> {
    match frames {
        [header, body] => Ok((header, body)),
        _ => Err(CommError::BadMessage {
            message: format!("Expected 2 {} frames, got {}", what, frames.len()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_frames_roundtrip() {
        let mut call = CallMessage::new(4, "add", Bytes::from_static(b"[1,2]"));
        call.command_id = 9;
        call.auth.push("token".to_string());

        let frames = call.to_frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(CallMessage::from_frames(&frames).unwrap(), call);
    }

    #[test]
    fn test_reply_rejects_wrong_frame_count() {
        let frames = vec![Bytes::from_static(b"{}")];
        assert!(matches!(
            ReplyMessage::from_frames(&frames),
            Err(CommError::BadMessage { .. })
        ));
    }

    #[test]
    fn test_reply_rejects_bad_header() {
        let frames = vec![Bytes::from_static(b"not json"), Bytes::new()];
        assert!(ReplyMessage::from_frames(&frames).is_err());
    }

    #[test]
    fn test_clear_empties_call() {
        let mut call = CallMessage::new(3, "run", Bytes::from_static(b"payload"));
        call.auth.push("a".into());
        call.clear();
        assert!(call.is_empty());
        assert_eq!(call.bodylen(), 0);
        assert!(call.auth.is_empty());
    }

    #[test]
    fn test_into_result_maps_status() {
        let reply = ReplyMessage::new(ReplyStatus::NoFunction, Bytes::from_static(b"no such method"));
        match reply.into_result() {
            Err(CommError::Status { status, message }) => {
                assert_eq!(status, ReplyStatus::NoFunction);
                assert_eq!(message, "no such method");
            }
            other => panic!("Expected Status error, got: {:?}", other),
        }
    }
}
