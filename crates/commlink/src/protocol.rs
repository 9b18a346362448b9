//! Methods of the well-known root object (id 0) and their JSON bodies.
//!
//! Every server answers these on both its object socket and its control
//! socket. Bodies are JSON; replies use the status codes of
//! [`crate::status::ReplyStatus`].

use serde::{Deserialize, Serialize};

pub const MAKE_OBJECT: &str = "make_object";
pub const PING: &str = "ping";
pub const DELETE_OBJECT: &str = "delete_object";
pub const SYNC_OBJECTS: &str = "sync_objects";
pub const GET_CONTROL_ADDRESS: &str = "get_control_address";
pub const GET_STATUS_PUBLISH_ADDRESS: &str = "get_status_publish_address";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeObjectRequest {
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeObjectResponse {
    pub object_id: u64,
}

/// Liveness check. The heartbeat also uses it to relay cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub value: String,
    /// Command the server should treat as cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_command: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteObjectRequest {
    pub object_id: u64,
}

/// Object list sent by a client.
///
/// With `active_list` set, `object_ids` is every id the client still holds
/// and the server releases all others. Otherwise it is a deletion list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncObjectsRequest {
    pub object_ids: Vec<u64>,
    pub active_list: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncObjectsResponse {
    pub released: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressResponse {
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_without_cancel_omits_field() {
        let ping = PingRequest {
            value: "hb".to_string(),
            cancel_command: None,
        };
        let json = serde_json::to_string(&ping).unwrap();
        assert_eq!(json, r#"{"value":"hb"}"#);

        let parsed: PingRequest = serde_json::from_str(r#"{"value":"hb","cancel_command":4}"#).unwrap();
        assert_eq!(parsed.cancel_command, Some(4));
    }
}
