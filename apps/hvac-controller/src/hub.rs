mod protocol;


use crate::config::HubConfig;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use protocol::HubMessage;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub const SENSOR_EVENT: &str = "ReceiveSensorData";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid hub url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported hub url scheme `{0}`")]
    Scheme(String),
    #[error("hub transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("hub rejected handshake: {0}")]
    Handshake(String),
    #[error("undecodable hub record: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("hub closed the connection: {}", .0.as_deref().unwrap_or("no reason given"))]
    RemoteClosed(Option<String>),
    #[error("no traffic from hub for {0:?}")]
    ServerTimeout(Duration),
    #[error("gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),
    #[error("listener task failed: {0}")]
    Task(String),
}

pub type EventHandler = Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type OpenHook = Box<dyn Fn() + Send + Sync>;
pub type CloseHook = Box<dyn Fn() + Send + Sync>;
pub type ErrorHook = Box<dyn Fn(&ListenerError) + Send + Sync>;

pub fn hub_url(host: &str, token: &str) -> Result<Url, ListenerError> {
    let mut url = Url::parse(&format!("{}/SensorHub", host.trim_end_matches('/')))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ListenerError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ListenerError::Scheme(url.scheme().to_string()))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

pub struct StreamListener {
    url: Url,
    settings: HubConfig,
    handlers: HashMap<String, EventHandler>,
    on_open: Option<OpenHook>,
    on_close: Option<CloseHook>,
    on_error: Option<ErrorHook>,
    state: watch::Sender<ConnectionState>,
}

enum SessionEnd {
    Stopped { was_open: bool },
    Lost { error: ListenerError, was_open: bool },
}

impl StreamListener {
    pub fn new(host: &str, token: &str, settings: HubConfig) -> Result<Self, ListenerError> {
        let url = hub_url(host, token)?;
        let (state, _) = watch::channel(ConnectionState::Closed);
        Ok(Self {
            url,
            settings,
            handlers: HashMap::new(),
            on_open: None,
            on_close: None,
            on_error: None,
            state,
        })
    }

    /// The handler is awaited before the next frame is read from the hub.
    pub fn on_event<F, Fut>(&mut self, target: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            target.to_string(),
            Box::new(move |arguments| handler(arguments).boxed()),
        );
    }

    pub fn on_open<F>(&mut self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_open = Some(Box::new(hook));
    }

    pub fn on_close<F>(&mut self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(hook));
    }

    pub fn on_error<F>(&mut self, hook: F)
    where
        F: Fn(&ListenerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(hook));
    }

    pub fn start(self) -> ListenerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.state.subscribe();
        self.set_state(ConnectionState::Connecting);
        let task = tokio::spawn(self.run(shutdown_rx));
        ListenerHandle {
            state,
            shutdown: shutdown_tx,
            task,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "hub connection state changed");
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ListenerError> {
        let max_attempts = self.settings.max_attempts;
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Closed);
                return Ok(());
            }

            match self.session(&mut shutdown, &mut attempts).await {
                SessionEnd::Stopped { was_open } => {
                    self.set_state(ConnectionState::Closed);
                    if was_open {
                        self.notify_close();
                    }
                    tracing::info!("hub listener stopped");
                    return Ok(());
                }
                SessionEnd::Lost { error, was_open } => {
                    tracing::warn!(error = %error, was_open, "hub connection lost");
                    if let Some(hook) = &self.on_error {
                        guard_hook("on_error", || hook(&error));
                    }
                    if was_open {
                        self.notify_close();
                    }
                }
            }

            if attempts >= max_attempts {
                self.set_state(ConnectionState::Closed);
                tracing::error!(attempts, "hub reconnect attempts exhausted");
                return Err(ListenerError::ReconnectExhausted(attempts));
            }
            attempts += 1;
            self.set_state(ConnectionState::Reconnecting);
            tracing::info!(attempt = attempts, max_attempts, "reconnecting to sensor hub");

            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry_interval()) => {}
                _ = shutdown.changed() => {
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
            }
        }
    }

    async fn session(&self, shutdown: &mut watch::Receiver<bool>, attempts: &mut u32) -> SessionEnd {
        let idle = self.settings.server_timeout();
        let lost = |error: ListenerError, was_open: bool| SessionEnd::Lost { error, was_open };

        let connect = tokio::time::timeout(idle, tokio_tungstenite::connect_async(self.url.as_str()));
        let mut ws = tokio::select! {
            res = connect => match res {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(err)) => return lost(err.into(), false),
                Err(_) => return lost(ListenerError::ServerTimeout(idle), false),
            },
            _ = shutdown.changed() => return SessionEnd::Stopped { was_open: false },
        };

        if let Err(err) = ws.send(Message::Text(protocol::handshake_request())).await {
            return lost(err.into(), false);
        }

        let mut open = false;
        let mut keep_alive = tokio::time::interval(self.settings.keep_alive());
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keep_alive.tick().await;
        let mut deadline = Instant::now() + idle;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if let Err(err) = ws.close(None).await {
                        tracing::debug!(error = %err, "hub close frame not delivered");
                    }
                    return SessionEnd::Stopped { was_open: open };
                }
                _ = keep_alive.tick(), if open => {
                    if let Err(err) = ws.send(Message::Text(protocol::ping())).await {
                        return lost(err.into(), open);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return lost(ListenerError::ServerTimeout(idle), open);
                }
                frame = ws.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty());
                            return lost(ListenerError::RemoteClosed(reason), open);
                        }
                        Some(Ok(_)) => {
                            deadline = Instant::now() + idle;
                            continue;
                        }
                        Some(Err(err)) => return lost(err.into(), open),
                        None => return lost(ListenerError::RemoteClosed(None), open),
                    };

                    for record in protocol::split_records(&text) {
                        if !open {
                            match protocol::parse_handshake(record) {
                                Ok(None) => {
                                    open = true;
                                    *attempts = 0;
                                    self.set_state(ConnectionState::Open);
                                    tracing::info!(url = %self.redacted_url(), "hub connection open");
                                    if let Some(hook) = &self.on_open {
                                        guard_hook("on_open", hook);
                                    }
                                }
                                Ok(Some(reason)) => {
                                    return lost(ListenerError::Handshake(reason), false);
                                }
                                Err(err) => return lost(err.into(), false),
                            }
                            continue;
                        }

                        match protocol::parse_message(record) {
                            Ok(HubMessage::Invocation { target, arguments }) => {
                                self.dispatch(&target, arguments).await;
                            }
                            Ok(HubMessage::Ping) => {}
                            Ok(HubMessage::Close { error }) => {
                                return lost(ListenerError::RemoteClosed(error), true);
                            }
                            Ok(HubMessage::Other(kind)) => {
                                tracing::debug!(kind, "ignoring hub message");
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "skipping undecodable hub record");
                            }
                        }
                    }
                    deadline = Instant::now() + idle;
                }
            }
        }
    }

    fn notify_close(&self) {
        if let Some(hook) = &self.on_close {
            guard_hook("on_close", hook);
        }
    }

    async fn dispatch(&self, target: &str, arguments: Vec<Value>) {
        let Some(handler) = self.handlers.get(target) else {
            tracing::debug!(event = %target, "no handler registered for hub event");
            return;
        };
        if AssertUnwindSafe(handler(arguments)).catch_unwind().await.is_err() {
            tracing::error!(event = %target, "hub event handler panicked; continuing");
        }
    }

    fn redacted_url(&self) -> String {
        let mut url = self.url.clone();
        url.set_query(Some("token=***"));
        url.to_string()
    }
}

/// Lifecycle hooks only observe; a panicking hook must not end the session.
fn guard_hook(name: &str, hook: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
        tracing::error!(hook = name, "hub lifecycle hook panicked; continuing");
    }
}

pub struct ListenerHandle {
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ListenerError>>,
}

impl ListenerHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Resolves when the receive loop exits. Must not be polled again once it
    /// has returned.
    pub async fn finished(&mut self) -> Result<(), ListenerError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(err) => Err(ListenerError::Task(err.to_string())),
        }
    }
}
