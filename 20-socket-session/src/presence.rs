//! Presence, directory and peer relay calls (the `channel` action).

use serde_json::{Value, json};

/// Broadcast subject carrying messages relayed from another client.
pub const MSG_FROM_CLIENT: &str = "msgFromClient";
/// Broadcast subject carrying directory changes.
pub const CLIENTS_STATE_UPDATE: &str = "__updateClientsState";

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelRequest {
    GetAvailableClients,
    UpdatePublicAlias { alias: String },
    GetPublicAlias,
    UpdatePublicAvailability { available: bool },
    GetPublicAvailability,
    /// Relays `data` to another client; the server addresses it by `client_id`.
    SendToClient { client_id: String, data: Value },
}

impl ChannelRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelRequest::GetAvailableClients => "getAvailableClients",
            ChannelRequest::UpdatePublicAlias { .. } => "updatePublicAlias",
            ChannelRequest::GetPublicAlias => "getPublicAlias",
            ChannelRequest::UpdatePublicAvailability { .. } => "updatePublicAvailability",
            ChannelRequest::GetPublicAvailability => "getPublicAvailability",
            ChannelRequest::SendToClient { .. } => "sendToClient",
        }
    }

    /// Splits the request into the `group` field and the `data` payload.
    pub fn into_parts(self) -> (String, Value) {
        match self {
            ChannelRequest::UpdatePublicAlias { alias } => (String::new(), json!({ "alias": alias })),
            ChannelRequest::UpdatePublicAvailability { available } => {
                (String::new(), json!({ "available": available }))
            }
            ChannelRequest::SendToClient { client_id, data } => (client_id, data),
            ChannelRequest::GetAvailableClients
            | ChannelRequest::GetPublicAlias
            | ChannelRequest::GetPublicAvailability => (String::new(), Value::Null),
        }
    }
}
