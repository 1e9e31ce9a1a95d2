//! Session ownership and the authentication gate.
//!
//! The gate decides whether outbound traffic may be written at all: only the
//! login call gets through without a session. It also turns login responses
//! into session state and tells the owner whether a failed login must stop
//! the reconnection loop.

use serde_json::Value;
use tracing::{info, warn};

use crate::codec::{Action, RequestName};
use crate::error::{AuthenticationFailed, ServerError};

/// Callback told about every login result that should be surfaced.
pub type AuthCallback = Box<dyn FnMut(Result<Value, AuthenticationFailed>) + Send + 'static>;

pub const LOGIN: &str = "login";
pub const LOGOUT: &str = "logout";

/// What a login response did to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// First successful login since `connect`.
    Connected,
    /// Session refreshed after a reconnection.
    Reconnected,
    /// Server rejected the credentials; reconnection must stop.
    Rejected,
}

#[derive(Default)]
pub struct AuthGate {
    credentials: Value,
    session: Option<Value>,
    auth_failed: bool,
    has_connected_before: bool,
    on_auth: Option<AuthCallback>,
}

/// True for the bootstrap call that is allowed without a session.
pub fn is_login(action: Action, request: &RequestName) -> bool {
    action == Action::Auth && request.is(LOGIN)
}

impl AuthGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fresh credential set, forgetting everything about the
    /// previous one.
    pub fn arm(&mut self, credentials: Value, on_auth: Option<AuthCallback>) {
        self.credentials = credentials;
        self.on_auth = on_auth;
        self.session = None;
        self.auth_failed = false;
        self.has_connected_before = false;
    }

    pub fn credentials(&self) -> &Value {
        &self.credentials
    }

    pub fn may_proceed(&self, action: Action, request: &RequestName) -> bool {
        self.session.is_some() || is_login(action, request)
    }

    /// Applies the server's answer to the login call.
    ///
    /// A first login always notifies the auth callback; later ones only when
    /// `notify_on_reconnect` is set. A rejection always notifies.
    pub fn complete_login(
        &mut self,
        outcome: Result<Value, ServerError>,
        notify_on_reconnect: bool,
    ) -> LoginOutcome {
        match outcome {
            Ok(session) => {
                let reconnected = self.has_connected_before;
                self.session = Some(session.clone());
                self.has_connected_before = true;
                info!(reconnected, "login accepted");

                if !reconnected || notify_on_reconnect {
                    self.notify(Ok(session));
                }
                if reconnected {
                    LoginOutcome::Reconnected
                } else {
                    LoginOutcome::Connected
                }
            }
            Err(ServerError(reason)) => {
                warn!(%reason, "login rejected");
                self.session = None;
                self.auth_failed = true;
                self.notify(Err(AuthenticationFailed { reason }));
                LoginOutcome::Rejected
            }
        }
    }

    fn notify(&mut self, outcome: Result<Value, AuthenticationFailed>) {
        if let Some(on_auth) = self.on_auth.as_mut() {
            on_auth(outcome);
        }
    }

    pub fn session(&self) -> Option<&Value> {
        self.session.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn clear_session(&mut self) {
        self.session = None;
    }

    pub fn auth_failed(&self) -> bool {
        self.auth_failed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    type Seen = Arc<Mutex<Vec<Result<Value, AuthenticationFailed>>>>;

    fn armed_gate() -> (AuthGate, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut gate = AuthGate::new();
        gate.arm(
            json!({"u": "a"}),
            Some(Box::new(move |outcome| sink.lock().unwrap().push(outcome))),
        );
        (gate, seen)
    }

    #[test]
    fn only_login_passes_without_session() {
        let (gate, _) = armed_gate();

        assert!(gate.may_proceed(Action::Auth, &"login".into()));
        assert!(!gate.may_proceed(Action::Auth, &"logout".into()));
        assert!(!gate.may_proceed(Action::Call, &"echo".into()));
        assert!(!gate.may_proceed(Action::Group, &"join".into()));
        assert!(!gate.may_proceed(Action::Channel, &"getPublicAlias".into()));
    }

    #[test]
    fn session_opens_the_gate() {
        let (mut gate, seen) = armed_gate();

        let outcome = gate.complete_login(Ok(json!({"token": "T"})), true);

        assert_eq!(outcome, LoginOutcome::Connected);
        assert_eq!(gate.session(), Some(&json!({"token": "T"})));
        assert!(gate.may_proceed(Action::Call, &"anything".into()));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn reconnect_login_is_silent_when_notifications_are_off() {
        let (mut gate, seen) = armed_gate();
        gate.complete_login(Ok(json!(1)), false);
        gate.clear_session();

        let outcome = gate.complete_login(Ok(json!(2)), false);

        assert_eq!(outcome, LoginOutcome::Reconnected);
        assert_eq!(gate.session(), Some(&json!(2)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn rejection_marks_gate_failed_and_notifies() {
        let (mut gate, seen) = armed_gate();

        let outcome = gate.complete_login(Err(ServerError(json!("bad password"))), true);

        assert_eq!(outcome, LoginOutcome::Rejected);
        assert!(gate.auth_failed());
        assert!(gate.session().is_none());
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            Err(AuthenticationFailed {
                reason: json!("bad password")
            })
        );
    }

    #[test]
    fn arming_again_resets_failure_and_first_login() {
        let (mut gate, _) = armed_gate();
        gate.complete_login(Err(ServerError(json!("no"))), true);

        gate.arm(json!({"u": "b"}), None);

        assert!(!gate.auth_failed());
        assert_eq!(gate.credentials(), &json!({"u": "b"}));
        assert_eq!(gate.complete_login(Ok(json!(1)), false), LoginOutcome::Connected);
    }
}
