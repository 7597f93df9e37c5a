// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! WebSocket connection to the live feed.
//!
//! [`Connection::spawn`] starts a task that owns the socket and a
//! [`FeedMachine`]. Callers talk to it through the returned handle; the
//! machine decides what happens and the task only performs I/O.

mod machine;

pub use machine::{Effect, FeedMachine, ABNORMAL_CLOSE_CODE, CLEAN_CLOSE_CODE};

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::geo::Bounds;
use crate::ledger::{AreaKey, Subscription, SubscriptionLedger};
use crate::protocol::{ControlFrame, EntityDescription, Fix};

/// Default live feed endpoint.
pub const DEFAULT_FEED_URL: &str = "ws://localhost:1337/data/fixes/live";

/// Default delay between opening and replaying subscriptions.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for the backoff delay before the next attempt.
    Reconnecting,
    /// Gave up after exhausting the reconnect budget.
    Abandoned,
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Events published by the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    ConnectionOpened,
    ConnectionClosed { code: u16, reason: String },
    ConnectionError(String),
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    ReconnectAbandoned { attempts: u32 },
    StateChanged(ConnectionState),
    SubscriptionAdded(Subscription),
    SubscriptionRemoved(Subscription),
    FixReceived(Fix),
    EntityReceived(EntityDescription),
}

/// Requests sent from the handle to the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    SubscribeArea(AreaKey),
    UnsubscribeArea(AreaKey),
    SyncAreas(Vec<AreaKey>),
    Stop,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL of the live feed.
    pub url: String,
    pub backoff: BackoffPolicy,
    /// Delay after opening before subscriptions are replayed.
    pub settle_delay: Duration,
    /// Capacity of the event channel.
    pub buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            backoff: BackoffPolicy::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            buffer_size: 1024,
        }
    }
}

/// Handle to a running live feed connection.
///
/// Dropping the handle stops the connection task.
pub struct Connection {
    command_tx: mpsc::UnboundedSender<Command>,
    event_rx: mpsc::Receiver<FeedEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    ledger_rx: watch::Receiver<SubscriptionLedger>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Spawn the connection task. Nothing is opened until [`connect`] or the
    /// first subscription.
    ///
    /// [`connect`]: Self::connect
    #[must_use]
    pub fn spawn(config: ConnectionConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.buffer_size.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (ledger_tx, ledger_rx) = watch::channel(SubscriptionLedger::new());
        let cancel_token = CancellationToken::new();

        let task = ConnectionTask {
            url: config.url,
            machine: FeedMachine::new(config.backoff, config.settle_delay),
            event_tx,
            state_tx,
            ledger_tx,
        };
        tokio::spawn(task.run(command_rx, cancel_token.clone()));

        Self {
            command_tx,
            event_rx,
            state_rx,
            ledger_rx,
            cancel_token,
        }
    }

    /// Receive the next event. Returns `None` once the task has stopped.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.event_rx.recv().await
    }

    pub fn connect(&self) {
        self.send_command(Command::Connect);
    }

    pub fn disconnect(&self) {
        self.send_command(Command::Disconnect);
    }

    /// Subscribe to an entity by id. Connects if needed.
    pub fn subscribe(&self, id: impl Into<String>) {
        self.send_command(Command::Subscribe(id.into()));
    }

    pub fn unsubscribe(&self, id: impl Into<String>) {
        self.send_command(Command::Unsubscribe(id.into()));
    }

    pub fn subscribe_area(&self, area: AreaKey) {
        self.send_command(Command::SubscribeArea(area));
    }

    pub fn unsubscribe_area(&self, area: AreaKey) {
        self.send_command(Command::UnsubscribeArea(area));
    }

    /// Replace the area subscriptions with the given cells.
    pub fn sync_areas(&self, areas: Vec<AreaKey>) {
        self.send_command(Command::SyncAreas(areas));
    }

    /// Follow a viewport: subscribe to every cell it covers.
    pub fn follow_bounds(&self, bounds: &Bounds) {
        self.sync_areas(AreaKey::covering(bounds));
    }

    /// Leave area mode; the socket closes if no entity subscriptions remain.
    pub fn stop(&self) {
        self.send_command(Command::Stop);
    }

    /// Stop the task without waiting for it.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Snapshot of the desired subscription set.
    #[must_use]
    pub fn subscriptions(&self) -> SubscriptionLedger {
        self.ledger_rx.borrow().clone()
    }

    fn send_command(&self, command: Command) {
        if self.command_tx.send(command).is_err() {
            warn!("Live feed task has stopped; command dropped");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, WsError>> + Send>>;

struct ConnectionTask {
    url: String,
    machine: FeedMachine,
    event_tx: mpsc::Sender<FeedEvent>,
    state_tx: watch::Sender<ConnectionState>,
    ledger_tx: watch::Sender<SubscriptionLedger>,
}

impl ConnectionTask {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        cancel_token: CancellationToken,
    ) {
        let mut socket: Option<WsStream> = None;
        let mut connecting: Option<ConnectFuture> = None;
        let mut reconnect_timer: Option<Pin<Box<Sleep>>> = None;
        let mut replay_timer: Option<Pin<Box<Sleep>>> = None;

        'run: loop {
            let effects = tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!("Live feed task cancelled");
                    break;
                }
                command = command_rx.recv() => match command {
                    Some(command) => self.machine.handle(command),
                    None => {
                        debug!("All live feed handles dropped");
                        break;
                    }
                },
                result = wait_on(&mut connecting) => {
                    connecting = None;
                    match result {
                        Ok(stream) => {
                            info!("Connected to {}", self.url);
                            socket = Some(stream);
                            self.machine.on_open()
                        }
                        Err(e) => {
                            let message = format!("connection to {} failed: {e}", self.url);
                            let mut effects = self.machine.on_error(&message);
                            effects.extend(self.machine.on_closed(ABNORMAL_CLOSE_CODE, &message));
                            effects
                        }
                    }
                }
                message = next_message(&mut socket) => self.on_message(message, &mut socket),
                () = wait_on(&mut reconnect_timer) => {
                    reconnect_timer = None;
                    self.machine.on_reconnect_timer()
                }
                () = wait_on(&mut replay_timer) => {
                    replay_timer = None;
                    self.machine.on_replay_timer()
                }
            };

            self.publish();
            for effect in effects {
                match effect {
                    Effect::Open => {
                        connecting = Some(Box::pin(open(self.url.clone())));
                    }
                    Effect::Send(frame) => send_frame(&mut socket, &frame).await,
                    Effect::Close => {
                        connecting = None;
                        if let Some(mut stream) = socket.take() {
                            close(&mut stream).await;
                        }
                    }
                    Effect::ScheduleReconnect(delay) => {
                        reconnect_timer = Some(Box::pin(sleep(delay)));
                    }
                    Effect::ScheduleReplay(delay) => {
                        replay_timer = Some(Box::pin(sleep(delay)));
                    }
                    Effect::CancelTimers => {
                        reconnect_timer = None;
                        replay_timer = None;
                    }
                    Effect::Emit(event) => {
                        tokio::select! {
                            biased;
                            () = cancel_token.cancelled() => {
                                debug!("Live feed task cancelled while events were backed up");
                                break 'run;
                            }
                            result = self.event_tx.send(event) => {
                                if result.is_err() {
                                    debug!("Live feed event receiver dropped");
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(mut stream) = socket.take() {
            close(&mut stream).await;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    fn on_message(
        &mut self,
        message: Option<Result<Message, WsError>>,
        socket: &mut Option<WsStream>,
    ) -> Vec<Effect> {
        match message {
            Some(Ok(Message::Text(text))) => self.machine.on_frame(&text),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => self.machine.on_frame(text),
                Err(e) => {
                    warn!("Dropping binary frame that is not UTF-8: {e}");
                    Vec::new()
                }
            },
            Some(Ok(Message::Close(frame))) => {
                *socket = None;
                let (code, reason) = frame.map_or_else(
                    || (u16::from(CloseCode::Status), String::new()),
                    |frame| (u16::from(frame.code), frame.reason.into_owned()),
                );
                self.machine.on_closed(code, &reason)
            }
            Some(Ok(_)) => Vec::new(),
            Some(Err(e)) => {
                *socket = None;
                let message = e.to_string();
                let mut effects = self.machine.on_error(&message);
                effects.extend(self.machine.on_closed(ABNORMAL_CLOSE_CODE, &message));
                effects
            }
            None => {
                *socket = None;
                self.machine
                    .on_closed(ABNORMAL_CLOSE_CODE, "connection closed without a close frame")
            }
        }
    }

    fn publish(&self) {
        self.state_tx.send_if_modified(|state| {
            let current = self.machine.state();
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
        self.ledger_tx.send_if_modified(|ledger| {
            if ledger == self.machine.ledger() {
                false
            } else {
                ledger.clone_from(self.machine.ledger());
                true
            }
        });
    }
}

/// Await the future in `slot`, or never resolve if it is empty.
async fn wait_on<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot.as_mut() {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_message(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn open(url: String) -> Result<WsStream, WsError> {
    debug!("Opening {url}");
    let (stream, _response) = connect_async(url.as_str()).await?;
    Ok(stream)
}

async fn send_frame(socket: &mut Option<WsStream>, frame: &ControlFrame) {
    let Some(stream) = socket.as_mut() else {
        debug!("No open socket for {frame:?}");
        return;
    };
    match frame.to_json() {
        Ok(json) => {
            if let Err(e) = stream.send(Message::Text(json)).await {
                warn!("Failed to send control frame: {e}");
            }
        }
        Err(e) => error!("Failed to encode control frame: {e}"),
    }
}

async fn close(stream: &mut WsStream) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed("client disconnect"),
    };
    if let Err(e) = stream.close(Some(frame)).await {
        debug!("Close handshake failed: {e}");
    }
}
