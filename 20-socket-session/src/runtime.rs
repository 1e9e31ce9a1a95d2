//! Async driver for [`SessionEngine`].
//!
//! A single worker task owns the engine, the current transport link and the
//! reconnection timer. Everything else talks to it through a cloneable
//! [`SessionHandle`]:
//!
//! - **Requests** from handles arrive on an unbounded channel, each with a
//!   oneshot for the answer
//! - **Transport events** arrive tagged with the link they came from; events of
//!   links that were already torn down are dropped
//! - **Status** (state, session, attempts) is published on a `watch` channel
//!
//! The worker never awaits inside a handler, so callbacks registered with the
//! engine always run on the worker task in arrival order.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use anyhow::{Context, Result, bail};

use crate::auth::AuthCallback;
use crate::broadcast::{Listener, SubscriptionId};
use crate::codec::{Action, EchoReply, GroupAck, RequestName};
use crate::config::SessionOptions;
use crate::correlation::Callback;
use crate::engine::{ConnectionState, SessionEngine, TransportCommand};
use crate::error::{AuthenticationFailed, CallError, EndpointError, ServerError};
use crate::presence::{CLIENTS_STATE_UPDATE, ChannelRequest, MSG_FROM_CLIENT};
use crate::transport::{Connector, LinkId, TransportEvent, TransportEventKind, TransportLink, WsConnector};

/// Snapshot of the session as last published by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub session: Option<Value>,
    pub attempts: u32,
}

impl SessionStatus {
    fn of(engine: &SessionEngine) -> Self {
        Self {
            state: engine.state(),
            session: engine.session().cloned(),
            attempts: engine.attempts(),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

/// A reply held back until the status it depends on has been published.
type Deferred = Box<dyn FnOnce() + Send>;

enum ClientRequest {
    Connect {
        endpoint: String,
        credentials: Value,
        on_auth: Option<AuthCallback>,
        respond_to: Reply<Result<(), EndpointError>>,
    },
    Send {
        action: Action,
        request: RequestName,
        group: String,
        data: Value,
        respond_to: Reply<Result<Value, CallError>>,
    },
    Broadcast {
        subject: String,
        group: Option<String>,
        data: Value,
        respond_to: Reply<Result<(), CallError>>,
    },
    Subscribe {
        subject: String,
        listener: Listener,
        respond_to: Reply<SubscriptionId>,
    },
    Unsubscribe {
        subject: String,
        id: SubscriptionId,
        respond_to: Reply<bool>,
    },
    Logout {
        respond_to: Reply<Result<Value, CallError>>,
    },
    Close {
        respond_to: Reply<()>,
    },
    Configure {
        update: Box<dyn FnOnce(&mut SessionOptions) + Send>,
        respond_to: Reply<SessionOptions>,
    },
    Shutdown,
}

/// Cloneable async front end of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<ClientRequest>,
    status: watch::Receiver<SessionStatus>,
}

/// Spawns a session worker on the current tokio runtime, using WebSockets.
pub fn spawn_session(options: SessionOptions) -> SessionHandle {
    spawn_session_with(SessionEngine::new(options), WsConnector)
}

/// Spawns a worker around a preconfigured engine and a custom connector.
pub fn spawn_session_with<C: Connector>(engine: SessionEngine, connector: C) -> SessionHandle {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SessionStatus::of(&engine));
    let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();

    let worker = Worker {
        engine,
        connector,
        requests: request_rx,
        events_tx,
        events_rx,
        link: None,
        next_link: 0,
        retry_at: None,
        status: status_tx,
        deferred_tx,
        deferred_rx,
    };
    tokio::spawn(worker.run());

    SessionHandle {
        requests: request_tx,
        status: status_rx,
    }
}

impl SessionHandle {
    async fn ask<T>(&self, request: impl FnOnce(Reply<T>) -> ClientRequest) -> Result<T> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(request(respond_to))
            .map_err(|_| anyhow::anyhow!("session worker stopped"))?;
        response.await.context("session worker dropped the request")
    }

    async fn call(&self, request: impl FnOnce(Reply<Result<Value, CallError>>) -> ClientRequest) -> Result<Value, CallError> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(request(respond_to))
            .map_err(|_| CallError::Stopped)?;
        // The worker drops the responder when the call is abandoned.
        response.await.unwrap_or(Err(CallError::ConnectionLost))
    }

    /// Targets `endpoint` and starts connecting in the background.
    ///
    /// Returns once the endpoint is accepted; use [`wait_until_connected`]
    /// to wait for the login.
    ///
    /// [`wait_until_connected`]: SessionHandle::wait_until_connected
    pub async fn connect(&self, endpoint: impl Into<String>, credentials: Value) -> Result<()> {
        self.connect_inner(endpoint.into(), credentials, None).await
    }

    /// Like [`connect`](SessionHandle::connect), with a callback told about
    /// login results.
    pub async fn connect_with_auth<F>(&self, endpoint: impl Into<String>, credentials: Value, on_auth: F) -> Result<()>
    where
        F: FnMut(Result<Value, AuthenticationFailed>) + Send + 'static,
    {
        self.connect_inner(endpoint.into(), credentials, Some(Box::new(on_auth)))
            .await
    }

    async fn connect_inner(&self, endpoint: String, credentials: Value, on_auth: Option<AuthCallback>) -> Result<()> {
        self.ask(|respond_to| ClientRequest::Connect {
            endpoint,
            credentials,
            on_auth,
            respond_to,
        })
        .await?
        .context("invalid endpoint")
    }

    /// Waits for an active session and returns it. Fails once the session
    /// closes instead.
    pub async fn wait_until_connected(&self) -> Result<Value> {
        let mut status = self.status.clone();
        let status = status
            .wait_for(|status| status.session.is_some() || status.state == ConnectionState::Closed)
            .await
            .context("session worker stopped")?;
        match &status.session {
            Some(session) => Ok(session.clone()),
            None => bail!("session closed before login completed"),
        }
    }

    /// Calls `name` on the server and waits for its response.
    pub async fn request_raw(&self, name: impl Into<RequestName>, data: Value) -> Result<Value, CallError> {
        self.send(Action::Call, name.into(), String::new(), data).await
    }

    /// Typed form of [`request_raw`](SessionHandle::request_raw).
    pub async fn request<T, R>(&self, name: impl Into<RequestName>, data: &T) -> Result<R, CallError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.request_raw(name, serde_json::to_value(data)?).await?;
        Ok(serde_json::from_value(response)?)
    }

    pub async fn echo<T>(&self, data: &T) -> Result<EchoReply<T>, CallError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.request("echo", data).await
    }

    pub async fn join_group(&self, group: &str) -> Result<GroupAck, CallError> {
        self.group("join", group).await
    }

    pub async fn leave_group(&self, group: &str) -> Result<GroupAck, CallError> {
        self.group("leave", group).await
    }

    pub async fn leave_all_groups(&self) -> Result<GroupAck, CallError> {
        self.group("leaveAll", "").await
    }

    async fn group(&self, request: &str, group: &str) -> Result<GroupAck, CallError> {
        let response = self
            .send(Action::Group, request.into(), group.to_string(), Value::Null)
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn send(&self, action: Action, request: RequestName, group: String, data: Value) -> Result<Value, CallError> {
        self.call(|respond_to| ClientRequest::Send {
            action,
            request,
            group,
            data,
            respond_to,
        })
        .await
    }

    async fn channel(&self, request: ChannelRequest) -> Result<Value, CallError> {
        let name = request.name();
        let (group, data) = request.into_parts();
        self.send(Action::Channel, name.into(), group, data).await
    }

    /// Publishes `data` under `subject`, optionally scoped to `group`.
    pub async fn broadcast<T>(&self, subject: &str, group: Option<&str>, data: &T) -> Result<(), CallError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(ClientRequest::Broadcast {
                subject: subject.to_string(),
                group: group.map(str::to_string),
                data,
                respond_to,
            })
            .map_err(|_| CallError::Stopped)?;
        response.await.unwrap_or(Err(CallError::Stopped))
    }

    /// Registers `listener` for pushes on `subject`. Survives reconnects.
    pub async fn on_message_received<F>(&self, subject: &str, listener: F) -> Result<SubscriptionId>
    where
        F: FnMut(Result<Value, ServerError>) + Send + 'static,
    {
        let subject = subject.to_string();
        self.ask(|respond_to| ClientRequest::Subscribe {
            subject,
            listener: Box::new(listener),
            respond_to,
        })
        .await
    }

    /// Channel-based variant of [`on_message_received`](SessionHandle::on_message_received).
    pub async fn subscribe(
        &self,
        subject: &str,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Result<Value, ServerError>>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .on_message_received(subject, move |message| {
                let _ = tx.send(message);
            })
            .await?;
        Ok((id, rx))
    }

    pub async fn remove_on_message_received(&self, subject: &str, id: SubscriptionId) -> Result<bool> {
        let subject = subject.to_string();
        self.ask(|respond_to| ClientRequest::Unsubscribe {
            subject,
            id,
            respond_to,
        })
        .await
    }

    pub async fn get_available_clients(&self) -> Result<Value, CallError> {
        self.channel(ChannelRequest::GetAvailableClients).await
    }

    pub async fn update_public_alias(&self, alias: &str) -> Result<Value, CallError> {
        self.channel(ChannelRequest::UpdatePublicAlias {
            alias: alias.to_string(),
        })
        .await
    }

    pub async fn get_public_alias(&self) -> Result<Value, CallError> {
        self.channel(ChannelRequest::GetPublicAlias).await
    }

    pub async fn update_public_availability(&self, available: bool) -> Result<Value, CallError> {
        self.channel(ChannelRequest::UpdatePublicAvailability { available })
            .await
    }

    pub async fn get_public_availability(&self) -> Result<Value, CallError> {
        self.channel(ChannelRequest::GetPublicAvailability).await
    }

    /// Relays `data` to another client through the server.
    pub async fn send_to_client<T>(&self, client_id: &str, data: &T) -> Result<Value, CallError>
    where
        T: Serialize + ?Sized,
    {
        self.channel(ChannelRequest::SendToClient {
            client_id: client_id.to_string(),
            data: serde_json::to_value(data)?,
        })
        .await
    }

    /// Messages other clients relayed to this one.
    pub async fn on_message_from_client<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: FnMut(Result<Value, ServerError>) + Send + 'static,
    {
        self.on_message_received(MSG_FROM_CLIENT, listener).await
    }

    /// Directory changes pushed by the server.
    pub async fn on_clients_state_update<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: FnMut(Result<Value, ServerError>) + Send + 'static,
    {
        self.on_message_received(CLIENTS_STATE_UPDATE, listener)
            .await
    }

    /// Ends the session on the server, then closes without reconnecting.
    pub async fn logout(&self) -> Result<Value, CallError> {
        self.call(|respond_to| ClientRequest::Logout { respond_to })
            .await
    }

    /// Closes the transport and stops reconnecting. In-flight calls fail with
    /// [`CallError::ConnectionLost`].
    pub async fn close(&self) -> Result<()> {
        self.ask(|respond_to| ClientRequest::Close { respond_to })
            .await
    }

    /// Applies `update` to the live options and returns the result.
    pub async fn configure<F>(&self, update: F) -> Result<SessionOptions>
    where
        F: FnOnce(&mut SessionOptions) + Send + 'static,
    {
        self.ask(|respond_to| ClientRequest::Configure {
            update: Box::new(update),
            respond_to,
        })
        .await
    }

    pub async fn options(&self) -> Result<SessionOptions> {
        self.configure(|_| {}).await
    }

    /// Stops the worker. Other handles fail with [`CallError::Stopped`] afterwards.
    pub fn shutdown(&self) -> Result<()> {
        self.requests
            .send(ClientRequest::Shutdown)
            .map_err(|_| anyhow::anyhow!("session worker already stopped"))
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().session.is_some()
    }

    pub fn session(&self) -> Option<Value> {
        self.status.borrow().session.clone()
    }

    /// The session payload decoded into `T`, if there is one.
    pub fn session_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.session().map(serde_json::from_value).transpose()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every published status change.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

struct Worker<C> {
    engine: SessionEngine,
    connector: C,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    link: Option<(LinkId, TransportLink)>,
    next_link: LinkId,
    retry_at: Option<Instant>,
    status: watch::Sender<SessionStatus>,
    deferred_tx: mpsc::UnboundedSender<Deferred>,
    deferred_rx: mpsc::UnboundedReceiver<Deferred>,
}

impl<C: Connector> Worker<C> {
    async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                biased;
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.engine.on_attempt_due();
                }
            }
            self.apply_commands();
            self.publish();
            self.flush_deferred();
        }

        self.engine.close();
        self.apply_commands();
        self.publish();
        self.flush_deferred();
        debug!("session worker stopped");
    }

    /// Returns `false` when the worker should stop.
    fn handle_request(&mut self, request: ClientRequest) -> bool {
        match request {
            ClientRequest::Connect {
                endpoint,
                credentials,
                on_auth,
                respond_to,
            } => {
                let result = self.engine.connect(&endpoint, credentials, on_auth);
                // Waiters must observe the new state once `connect` returns.
                self.apply_commands();
                self.publish();
                let _ = respond_to.send(result);
            }
            ClientRequest::Send {
                action,
                request,
                group,
                data,
                respond_to,
            } => {
                let callback: Callback = Box::new(move |outcome| {
                    let _ = respond_to.send(outcome);
                });
                self.engine.send(action, request, group, data, Some(callback));
            }
            ClientRequest::Broadcast {
                subject,
                group,
                data,
                respond_to,
            } => {
                let _ = respond_to.send(self.engine.broadcast(&subject, group.as_deref(), data));
            }
            ClientRequest::Subscribe {
                subject,
                listener,
                respond_to,
            } => {
                let _ = respond_to.send(self.engine.on_message_received(subject, listener));
            }
            ClientRequest::Unsubscribe {
                subject,
                id,
                respond_to,
            } => {
                let _ = respond_to.send(self.engine.remove_on_message_received(&subject, id));
            }
            ClientRequest::Logout { respond_to } => {
                // Logout closes the engine; the caller must see `Closed` once it returns.
                let deferred = self.deferred_tx.clone();
                self.engine.logout(Some(Box::new(move |outcome| {
                    let _ = deferred.send(Box::new(move || {
                        let _ = respond_to.send(outcome);
                    }));
                })));
            }
            ClientRequest::Close { respond_to } => {
                self.engine.close();
                self.apply_commands();
                self.publish();
                let _ = respond_to.send(());
            }
            ClientRequest::Configure { update, respond_to } => {
                update(self.engine.options_mut());
                let _ = respond_to.send(self.engine.options().clone());
            }
            ClientRequest::Shutdown => {
                info!("session worker shutting down");
                return false;
            }
        }
        true
    }

    fn flush_deferred(&mut self) {
        while let Ok(reply) = self.deferred_rx.try_recv() {
            reply();
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        if self.link.as_ref().map(|(id, _)| *id) != Some(event.link) {
            debug!(link = event.link, "dropping event from a stale link");
            return;
        }
        match event.kind {
            TransportEventKind::Open => self.engine.on_transport_open(),
            TransportEventKind::Message(frame) => self.engine.on_transport_message(&frame),
            TransportEventKind::Lost(reason) => self.engine.on_transport_lost(reason),
        }
    }

    fn apply_commands(&mut self) {
        for command in self.engine.poll_commands() {
            match command {
                TransportCommand::Open { url } => {
                    self.next_link += 1;
                    let id = self.next_link;
                    let link = self.connector.open(id, &url, self.events_tx.clone());
                    self.link = Some((id, link));
                }
                TransportCommand::Send(frame) => match &self.link {
                    Some((id, link)) => {
                        if !link.send(frame) {
                            debug!(link = *id, "link task gone, frame dropped");
                        }
                    }
                    None => debug!("no transport, frame dropped"),
                },
                TransportCommand::Teardown => {
                    self.link = None;
                }
                TransportCommand::ScheduleAttempt(delay) => {
                    self.retry_at = Some(Instant::now() + delay);
                }
                TransportCommand::CancelAttempt => {
                    self.retry_at = None;
                }
            }
        }
    }

    fn publish(&self) {
        let next = SessionStatus::of(&self.engine);
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;

    /// Connector whose links never open; frames are recorded.
    struct SilentConnector {
        opened: mpsc::UnboundedSender<(LinkId, String)>,
    }

    impl Connector for SilentConnector {
        fn open(&mut self, link: LinkId, url: &str, _events: crate::transport::TransportEvents) -> TransportLink {
            let _ = self.opened.send((link, url.to_string()));
            let (tx, _rx) = mpsc::unbounded_channel();
            TransportLink::new(tx)
        }
    }

    fn silent_session() -> (SessionHandle, mpsc::UnboundedReceiver<(LinkId, String)>) {
        let (opened, opened_rx) = mpsc::unbounded_channel();
        let handle = spawn_session_with(
            SessionEngine::new(SessionOptions::default()),
            SilentConnector { opened },
        );
        (handle, opened_rx)
    }

    #[tokio::test]
    async fn calls_before_login_fail_fast() {
        let (handle, _opened) = silent_session();

        let err = handle.request_raw("anything", json!({})).await.unwrap_err();
        assert!(matches!(err, CallError::NotAuthenticated));
        assert!(matches!(
            handle.broadcast("news", None, &json!(1)).await,
            Err(CallError::NotAuthenticated)
        ));
        assert!(!handle.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn logout_reply_follows_the_closed_status() {
        let (handle, _opened) = silent_session();
        handle.connect("ws://127.0.0.1:9", json!({})).await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Connecting);

        for _ in 0..50 {
            let err = handle.logout().await.unwrap_err();
            assert!(matches!(err, CallError::NotAuthenticated));
            assert_eq!(handle.state(), ConnectionState::Closed);
            handle.connect("ws://127.0.0.1:9", json!({})).await.unwrap();
        }
    }

    #[tokio::test]
    async fn connect_opens_normalized_url() {
        let (handle, mut opened) = silent_session();

        handle.connect("http://127.0.0.1:9", json!({"u": "a"})).await.unwrap();

        let (link, url) = timeout(Duration::from_secs(1), opened.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link, 1);
        assert_eq!(url, "ws://127.0.0.1:9/");
        assert_eq!(handle.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected() {
        let (handle, _opened) = silent_session();

        assert!(handle.connect("/relative", json!(null)).await.is_err());
        assert_eq!(handle.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn configure_updates_live_options() {
        let (handle, _opened) = silent_session();

        let options = handle
            .configure(|options| options.reconnection_delay_ms = 10)
            .await
            .unwrap();

        assert_eq!(options.reconnection_delay_ms, 10);
        assert_eq!(handle.options().await.unwrap().reconnection_delay_ms, 10);
    }

    #[tokio::test]
    async fn close_fails_pending_waiters_and_shutdown_stops_worker() {
        let (handle, _opened) = silent_session();
        handle.connect("ws://127.0.0.1:9", json!({})).await.unwrap();

        handle.close().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(handle.wait_until_connected().await.is_err());

        handle.shutdown().unwrap();
        let stopped = timeout(Duration::from_secs(1), async {
            loop {
                match handle.request_raw("x", Value::Null).await {
                    Err(CallError::Stopped) => break,
                    _ => tokio::task::yield_now().await,
                }
            }
        })
        .await;
        assert!(stopped.is_ok());
    }
}
