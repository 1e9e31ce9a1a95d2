//! Session options.
//!
//! Keys follow the camelCase names used by the protocol's clients so a JSON
//! options document can be shared between them. Missing keys take defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    /// Reconnect after a transport error or an unexpected close.
    pub auto_reconnect_on_error: bool,
    /// Tell the auth callback about logins that follow a reconnection.
    pub notify_on_reconnect_auth: bool,
    /// Fixed pause between reconnection attempts.
    pub reconnection_delay_ms: u64,
    /// Consecutive failures tolerated before giving up.
    pub max_reconnection_attempts: u32,
    /// Host that endpoints starting with `/` are resolved against.
    pub origin: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect_on_error: true,
            notify_on_reconnect_auth: true,
            reconnection_delay_ms: 2_000,
            max_reconnection_attempts: 20,
            origin: None,
        }
    }
}

impl SessionOptions {
    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }

    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let options = SessionOptions::from_json("{}").expect("parse");
        assert_eq!(options, SessionOptions::default());
        assert_eq!(options.reconnection_delay(), Duration::from_secs(2));
        assert_eq!(options.max_reconnection_attempts, 20);
    }

    #[test]
    fn camel_case_keys_override_defaults() {
        let options = SessionOptions::from_json(
            r#"{"autoReconnectOnError": false, "notifyOnReconnectAuth": false, "reconnectionDelayMs": 50, "origin": "example.com"}"#,
        )
        .expect("parse");

        assert!(!options.auto_reconnect_on_error);
        assert!(!options.notify_on_reconnect_auth);
        assert_eq!(options.reconnection_delay(), Duration::from_millis(50));
        assert_eq!(options.max_reconnection_attempts, 20);
        assert_eq!(options.origin.as_deref(), Some("example.com"));
    }
}
