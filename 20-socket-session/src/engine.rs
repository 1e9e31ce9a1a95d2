//! Connection and session state machine.
//!
//! [`SessionEngine`] owns everything a session needs: the auth gate, the table
//! of in-flight calls, the broadcast listeners, the sequence counter and the
//! reconnection policy. It never touches a socket or a clock. Whoever drives it
//! feeds it transport events (`on_transport_*`), tells it when a scheduled
//! attempt is due, and executes the [`TransportCommand`]s it queues, collected
//! with [`SessionEngine::poll_commands`].
//!
//! # States
//!
//! ```text
//! Idle -> Connecting -> Open -> Authenticating -> Active
//!            ^                                     |
//!            +------------- Retrying <-------------+ (transport error/close)
//! any -> Closed (close, logout, rejected login, attempts exhausted)
//! ```
//!
//! Every handler runs to completion and invokes callbacks synchronously, so the
//! engine needs exclusive access but no locking.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthCallback, AuthGate, LOGIN, LOGOUT, LoginOutcome};
use crate::broadcast::{BroadcastRegistry, Listener, SubscriptionId};
use crate::codec::{self, Action, Package, PackageInfo, PackageResponse, RequestName};
use crate::config::SessionOptions;
use crate::correlation::{Callback, Continuation, CorrelationTable, Resolution};
use crate::endpoint;
use crate::error::{CallError, DisconnectReason, EndpointError, EngineError, ServerError};
use crate::presence::ChannelRequest;

/// Engine-wide error reporter.
pub type ErrorHandler = Box<dyn FnMut(&EngineError) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing has been connected yet.
    Idle,
    /// A transport is being opened (or about to be).
    Connecting,
    /// Transport is up; per-connection state is being reset.
    Open,
    /// Login call sent, waiting for the verdict.
    Authenticating,
    /// Logged in; all traffic flows.
    Active,
    /// Transport was lost; a new attempt is scheduled.
    Retrying,
    /// Terminal until the next `connect`.
    Closed,
}

/// Side effects requested from the driver, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Open a transport to `url` and report its events back.
    Open { url: String },
    /// Write one text frame to the current transport.
    Send(String),
    /// Drop the current transport. Its later events must not reach the engine.
    Teardown,
    /// Call [`SessionEngine::on_attempt_due`] after this delay.
    ScheduleAttempt(Duration),
    /// Forget a previously scheduled attempt.
    CancelAttempt,
}

struct Unsent {
    source: serde_json::Error,
    continuation: Option<Continuation>,
}

pub struct SessionEngine {
    options: SessionOptions,
    state: ConnectionState,
    target: Option<String>,
    gate: AuthGate,
    pending: CorrelationTable,
    listeners: BroadcastRegistry,
    next_sequence: u64,
    attempts: u32,
    reconnect: bool,
    has_transport: bool,
    attempt_scheduled: bool,
    on_error: ErrorHandler,
    commands: VecDeque<TransportCommand>,
}

fn log_error(err: &EngineError) {
    warn!(kind = ?err.kind(), error = %err, "session error");
}

impl SessionEngine {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            state: ConnectionState::Idle,
            target: None,
            gate: AuthGate::new(),
            pending: CorrelationTable::new(),
            listeners: BroadcastRegistry::new(),
            next_sequence: 0,
            attempts: 0,
            reconnect: false,
            has_transport: false,
            attempt_scheduled: false,
            on_error: Box::new(log_error),
            commands: VecDeque::new(),
        }
    }

    /// Replaces the default handler, which logs every report at `warn`.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&EngineError) + Send + 'static,
    {
        self.on_error = Box::new(handler);
        self
    }

    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&EngineError) + Send + 'static,
    {
        self.on_error = Box::new(handler);
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Options can change at any time; they are read when next needed.
    pub fn options_mut(&mut self) -> &mut SessionOptions {
        &mut self.options
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.gate.is_authenticated()
    }

    pub fn session(&self) -> Option<&Value> {
        self.gate.session()
    }

    /// URL of the current target, after normalization.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Consecutive connection failures since the last successful login.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn listener_count(&self, subject: &str) -> usize {
        self.listeners.listener_count(subject)
    }

    /// Drains the commands queued since the last poll.
    pub fn poll_commands(&mut self) -> Vec<TransportCommand> {
        self.commands.drain(..).collect()
    }

    /// Targets `endpoint` with `credentials` and schedules an immediate attempt.
    ///
    /// Any previous transport is torn down and the reconnection budget and
    /// authentication failure flag start over.
    pub fn connect(
        &mut self,
        endpoint: &str,
        credentials: Value,
        on_auth: Option<AuthCallback>,
    ) -> Result<(), EndpointError> {
        let url = endpoint::normalize(endpoint, self.options.origin.as_deref())?;
        info!(%url, "connecting");

        self.teardown();
        self.cancel_attempt();
        self.reset_connection_state();
        self.target = Some(url);
        self.gate.arm(credentials, on_auth);
        self.attempts = 0;
        self.reconnect = true;
        self.state = ConnectionState::Connecting;
        self.schedule_attempt(Duration::ZERO);
        Ok(())
    }

    /// A scheduled attempt is due: open a fresh transport.
    pub fn on_attempt_due(&mut self) {
        self.attempt_scheduled = false;
        if self.has_transport
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Retrying
            )
        {
            debug!(state = ?self.state, "ignoring stale connection attempt");
            return;
        }
        let Some(url) = self.target.clone() else {
            return;
        };

        debug!(%url, attempt = self.attempts + 1, "opening transport");
        self.gate.clear_session();
        self.reset_connection_state();
        self.has_transport = true;
        self.state = ConnectionState::Connecting;
        self.commands.push_back(TransportCommand::Open { url });
    }

    /// Transport is up: start from a clean slate and log in.
    pub fn on_transport_open(&mut self) {
        if !self.has_transport || self.state != ConnectionState::Connecting {
            debug!(state = ?self.state, "ignoring unexpected transport open");
            return;
        }
        self.state = ConnectionState::Open;
        self.reset_connection_state();

        self.state = ConnectionState::Authenticating;
        let credentials = self.gate.credentials().clone();
        if let Err(unsent) = self.transmit(
            Action::Auth,
            LOGIN.into(),
            String::new(),
            credentials,
            Some(Continuation::Login),
        ) {
            self.report(EngineError::Encode(unsent.source));
        }
    }

    /// One inbound frame. Malformed frames are reported and otherwise ignored.
    pub fn on_transport_message(&mut self, frame: &str) {
        if !self.has_transport {
            debug!("ignoring frame without a transport");
            return;
        }
        match codec::decode(frame) {
            Ok(response) => self.route(response),
            Err(err) => self.report(EngineError::Decode(err)),
        }
    }

    pub fn on_transport_error(&mut self, message: impl Into<String>) {
        self.on_transport_lost(DisconnectReason::Error(message.into()));
    }

    pub fn on_transport_closed(&mut self, code: Option<u16>, reason: impl Into<String>) {
        self.on_transport_lost(DisconnectReason::Closed {
            code,
            reason: reason.into(),
        });
    }

    /// The current transport failed or was closed by the remote side.
    ///
    /// Reports [`EngineError::ConnectionLost`], abandons in-flight calls and,
    /// unless reconnection is off or the login was rejected, schedules the
    /// next attempt. Once the budget of consecutive failures is spent the
    /// engine closes and reports [`EngineError::MaxReconnectionAttempts`].
    pub fn on_transport_lost(&mut self, reason: DisconnectReason) {
        if !self.has_transport {
            debug!(%reason, "ignoring loss of a transport that is already gone");
            return;
        }
        warn!(%reason, state = ?self.state, "connection lost");

        self.teardown();
        self.gate.clear_session();
        self.reset_connection_state();
        self.report(EngineError::ConnectionLost(reason));

        self.attempts += 1;
        if !self.reconnect || !self.options.auto_reconnect_on_error || self.gate.auth_failed() {
            info!("reconnection disabled, staying closed");
            self.state = ConnectionState::Closed;
            return;
        }
        if self.attempts >= self.options.max_reconnection_attempts {
            error!(attempts = self.attempts, "giving up on reconnection");
            self.state = ConnectionState::Closed;
            self.report(EngineError::MaxReconnectionAttempts {
                attempts: self.attempts,
            });
            return;
        }

        let delay = self.options.reconnection_delay();
        info!(attempt = self.attempts, ?delay, "scheduling reconnection");
        self.state = ConnectionState::Retrying;
        self.schedule_attempt(delay);
    }

    /// Stops for good: no reconnection, transport dropped, in-flight calls
    /// abandoned without being invoked. Broadcast listeners are kept.
    pub fn close(&mut self) {
        info!("closing session");
        self.reconnect = false;
        self.teardown();
        self.cancel_attempt();
        self.gate.clear_session();
        self.reset_connection_state();
        self.state = ConnectionState::Closed;
    }

    /// Sends `auth`/`logout`, then closes once the server answers and finally
    /// hands the answer to `callback`.
    pub fn logout(&mut self, callback: Option<Callback>) {
        self.reconnect = false;
        if !self.gate.is_authenticated() {
            self.close();
            if let Some(callback) = callback {
                callback(Err(CallError::NotAuthenticated));
            }
            return;
        }

        if let Err(unsent) = self.transmit(
            Action::Auth,
            LOGOUT.into(),
            String::new(),
            Value::Null,
            Some(Continuation::Logout(callback)),
        ) {
            self.close();
            if let Some(Continuation::Logout(Some(callback))) = unsent.continuation {
                callback(Err(CallError::Payload(unsent.source)));
            }
        }
    }

    /// The single outbound primitive.
    ///
    /// Without a session, only the login call is written; everything else
    /// fails on the spot with [`CallError::NotAuthenticated`] delivered to
    /// `callback`. Calls without a callback still take a sequence number, so a
    /// late reply to one can never be mistaken for another call's reply.
    pub fn send(
        &mut self,
        action: Action,
        request: RequestName,
        group: impl Into<String>,
        data: Value,
        callback: Option<Callback>,
    ) {
        if !self.gate.may_proceed(action, &request) {
            debug!(?action, %request, "refusing send without a session");
            match callback {
                Some(callback) => callback(Err(CallError::NotAuthenticated)),
                None => debug!("fire-and-forget send dropped"),
            }
            return;
        }

        let continuation = callback.map(Continuation::Reply);
        if let Err(unsent) = self.transmit(action, request, group.into(), data, continuation) {
            match unsent.continuation {
                Some(Continuation::Reply(callback)) => callback(Err(CallError::Payload(unsent.source))),
                _ => self.report(EngineError::Encode(unsent.source)),
            }
        }
    }

    pub fn request(&mut self, name: impl Into<RequestName>, data: Value, callback: Option<Callback>) {
        self.send(Action::Call, name.into(), String::new(), data, callback);
    }

    /// The server answers with `{echoAt, received}`.
    pub fn echo(&mut self, data: Value, callback: Option<Callback>) {
        self.request("echo", data, callback);
    }

    pub fn join_group(&mut self, group: &str, callback: Option<Callback>) {
        self.send(Action::Group, "join".into(), group, Value::Null, callback);
    }

    pub fn leave_group(&mut self, group: &str, callback: Option<Callback>) {
        self.send(Action::Group, "leave".into(), group, Value::Null, callback);
    }

    pub fn leave_all_groups(&mut self, callback: Option<Callback>) {
        self.send(Action::Group, "leaveAll".into(), String::new(), Value::Null, callback);
    }

    pub fn channel(&mut self, request: ChannelRequest, callback: Option<Callback>) {
        let name = request.name();
        let (group, data) = request.into_parts();
        self.send(Action::Channel, name.into(), group, data, callback);
    }

    /// Publishes to `subject`, optionally scoped to `group`. Nothing comes back.
    pub fn broadcast(&mut self, subject: &str, group: Option<&str>, data: Value) -> Result<(), CallError> {
        let request = RequestName::from(subject);
        if !self.gate.may_proceed(Action::Broadcast, &request) {
            return Err(CallError::NotAuthenticated);
        }
        let group = group.unwrap_or_default().to_string();
        self.transmit(Action::Broadcast, request, group, data, None)
            .map_err(|unsent| CallError::Payload(unsent.source))
    }

    pub fn on_message_received(&mut self, subject: impl Into<String>, listener: Listener) -> SubscriptionId {
        self.listeners.subscribe(subject, listener)
    }

    pub fn remove_on_message_received(&mut self, subject: &str, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(subject, id)
    }

    fn transmit(
        &mut self,
        action: Action,
        request: RequestName,
        group: String,
        data: Value,
        continuation: Option<Continuation>,
    ) -> Result<(), Unsent> {
        let sequence = self.next_sequence;
        let package = Package {
            info: PackageInfo {
                action,
                request,
                group,
                sequence,
            },
            data,
        };
        let frame = match codec::encode(&package) {
            Ok(frame) => frame,
            Err(source) => return Err(Unsent { source, continuation }),
        };

        if let Some(continuation) = continuation {
            self.pending.register(sequence, continuation);
        }
        // Broadcasts are never answered, so they carry the counter without using it up.
        if action != Action::Broadcast {
            self.next_sequence += 1;
        }
        self.commands.push_back(TransportCommand::Send(frame));
        Ok(())
    }

    fn route(&mut self, response: PackageResponse) {
        match response.info.action {
            Action::Broadcast => {
                let subject = response.info.request.to_string();
                let delivered = self.listeners.dispatch(&subject, response.into_outcome());
                debug!(%subject, delivered, "broadcast received");
            }
            Action::Call | Action::Group | Action::Auth | Action::Channel => {
                let sequence = response.info.sequence;
                if !self.resolve(sequence, response.into_outcome()) {
                    debug!(sequence, "response without a pending call");
                }
            }
        }
    }

    fn resolve(&mut self, sequence: u64, outcome: Result<Value, ServerError>) -> bool {
        match self.pending.resolve(sequence, outcome) {
            Resolution::Replied => {}
            Resolution::Login(outcome) => self.finish_login(outcome),
            Resolution::Logout(callback, outcome) => {
                self.close();
                if let Some(callback) = callback {
                    callback(outcome.map_err(CallError::from));
                }
            }
            Resolution::Unmatched => return false,
        }
        true
    }

    fn finish_login(&mut self, outcome: Result<Value, ServerError>) {
        match self.gate.complete_login(outcome, self.options.notify_on_reconnect_auth) {
            LoginOutcome::Connected | LoginOutcome::Reconnected => {
                self.attempts = 0;
                self.state = ConnectionState::Active;
            }
            LoginOutcome::Rejected => {
                // Terminal for this credential set; only `connect` re-arms it.
                self.teardown();
                self.cancel_attempt();
                self.reset_connection_state();
                self.state = ConnectionState::Closed;
            }
        }
    }

    fn reset_connection_state(&mut self) {
        self.pending.clear();
        self.next_sequence = 0;
    }

    fn teardown(&mut self) {
        if self.has_transport {
            self.has_transport = false;
            self.commands.push_back(TransportCommand::Teardown);
        }
    }

    fn schedule_attempt(&mut self, delay: Duration) {
        self.attempt_scheduled = true;
        self.commands.push_back(TransportCommand::ScheduleAttempt(delay));
    }

    fn cancel_attempt(&mut self) {
        if self.attempt_scheduled {
            self.attempt_scheduled = false;
            self.commands.push_back(TransportCommand::CancelAttempt);
        }
    }

    fn report(&mut self, err: EngineError) {
        (self.on_error)(&err);
    }
}
