//! Push-channel supervision: connect, authenticate, resynchronize, subscribe,
//! and reconnect with capped exponential backoff.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{RoomId, UserId},
    protocol::{ClientFrame, PushPayload, RosterPayload, ServerFrame, Topic},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::ClientError, reconcile::ReconciliationEngine, session::SessionManager, ClientEvent,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    /// Anything short of a live, subscribed channel.
    pub fn is_degraded(self) -> bool {
        !matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Background time after which a foreground resume skips the backoff wait.
    pub foreground_threshold: Duration,
    /// A connection that stayed up this long resets the backoff.
    pub stable_after: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            foreground_threshold: Duration::from_secs(5),
            stable_after: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Box<dyn PushConnection>>;
}

#[async_trait]
pub trait PushConnection: Send {
    async fn send(&mut self, frame: ClientFrame) -> anyhow::Result<()>;
    /// `Ok(None)` once the peer has closed the channel.
    async fn recv(&mut self) -> anyhow::Result<Option<ServerFrame>>;
    async fn close(&mut self) -> anyhow::Result<()>;
}

pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn from_server_url(server_url: &str) -> Result<Self, ClientError> {
        let mut url = Url::parse(server_url)?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ClientError::Config(format!(
                    "server_url must start with http:// or https://, got '{other}'"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config(format!("cannot derive websocket url from {server_url}")))?;
        url.set_path("/ws");
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self) -> anyhow::Result<Box<dyn PushConnection>> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn send(&mut self, frame: ClientFrame) -> anyhow::Result<()> {
        let text = serde_json::to_string(&frame)?;
        self.stream
            .send(Message::Text(text))
            .await
            .context("websocket send failed")
    }

    async fn recv(&mut self) -> anyhow::Result<Option<ServerFrame>> {
        while let Some(message) = self.stream.next().await {
            match message.context("websocket receive failed")? {
                Message::Text(text) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(err) => warn!("realtime: dropping malformed frame: {err}"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.stream
            .close(None)
            .await
            .context("websocket close failed")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicHandler {
    GlobalUpdate(RoomId),
    RoomUpdate(RoomId),
    RosterUpdate(RoomId),
}

/// Topic name to handler for the currently subscribed room.
#[derive(Debug, Default)]
struct SubscriptionSet {
    handlers: HashMap<String, TopicHandler>,
}

impl SubscriptionSet {
    async fn establish(
        connection: &mut dyn PushConnection,
        room_id: RoomId,
    ) -> anyhow::Result<Self> {
        let mut set = Self::default();
        for topic in Topic::for_room(room_id) {
            let name = topic.to_string();
            connection
                .send(ClientFrame::Subscribe {
                    topic: name.clone(),
                })
                .await?;
            let handler = match topic {
                Topic::Global => TopicHandler::GlobalUpdate(room_id),
                Topic::Room(room_id) => TopicHandler::RoomUpdate(room_id),
                Topic::Roster => TopicHandler::RosterUpdate(room_id),
            };
            set.handlers.insert(name, handler);
        }
        Ok(set)
    }

    /// Clears the set even when an unsubscribe frame cannot be delivered.
    async fn teardown(&mut self, connection: &mut dyn PushConnection) -> anyhow::Result<()> {
        let mut topics: Vec<String> = self.handlers.drain().map(|(topic, _)| topic).collect();
        topics.sort();
        for topic in topics {
            connection.send(ClientFrame::Unsubscribe { topic }).await?;
        }
        Ok(())
    }

    fn handler(&self, topic: &str) -> Option<TopicHandler> {
        self.handlers.get(topic).copied()
    }
}

enum Command {
    SwitchRoom {
        room_id: RoomId,
        done: oneshot::Sender<()>,
    },
    Foreground {
        hidden_for: Duration,
    },
    Close,
}

enum PumpExit {
    Closed,
    Dropped(String),
}

enum RetryWait {
    Retry,
    Close,
}

struct RunningSupervisor {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl RunningSupervisor {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

pub struct ChannelSupervisor {
    connector: Arc<dyn PushConnector>,
    session: Arc<SessionManager>,
    engine: Arc<ReconciliationEngine>,
    policy: ReconnectPolicy,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ClientEvent>,
    running: Mutex<Option<RunningSupervisor>>,
}

impl ChannelSupervisor {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        session: Arc<SessionManager>,
        engine: Arc<ReconciliationEngine>,
        policy: ReconnectPolicy,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            connector,
            session,
            engine,
            policy,
            status,
            events,
            running: Mutex::new(None),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Starts supervising the channel for `room_id`; an already running
    /// supervisor switches rooms instead.
    pub async fn connect(self: &Arc<Self>, room_id: RoomId) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(RunningSupervisor::is_alive) {
            drop(running);
            self.switch_room(room_id).await;
            return;
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let supervisor = Arc::clone(self);
        let task = tokio::spawn(async move { supervisor.run(room_id, receiver).await });
        *running = Some(RunningSupervisor { commands, task });
    }

    /// Returns once the old topics are gone and the new room's snapshot and
    /// subscriptions are in place (or the channel fell back to reconnecting).
    pub async fn switch_room(&self, room_id: RoomId) {
        let commands = self
            .running
            .lock()
            .await
            .as_ref()
            .filter(|running| running.is_alive())
            .map(|running| running.commands.clone());

        if let Some(commands) = commands {
            let (done, finished) = oneshot::channel();
            if commands.send(Command::SwitchRoom { room_id, done }).is_ok() {
                let _ = finished.await;
                return;
            }
        }

        if let Err(err) = self.engine.load_snapshot(room_id).await {
            warn!(room_id = room_id.0, "realtime: snapshot without channel failed: {err}");
        }
    }

    pub async fn notify_foreground(&self, hidden_for: Duration) {
        if let Some(running) = self.running.lock().await.as_ref() {
            let _ = running.commands.send(Command::Foreground { hidden_for });
        }
    }

    pub async fn shutdown(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.commands.send(Command::Close);
            let mut task = running.task;
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("realtime: supervisor did not stop in time; aborting");
                task.abort();
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn run(
        self: Arc<Self>,
        mut room_id: RoomId,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut backoff = Backoff::new(self.policy.base_delay, self.policy.max_delay);
        // Set by a long foreground resume while connected; the next drop
        // reconnects without waiting.
        let mut resumed = false;
        self.set_status(ConnectionStatus::Connecting);

        loop {
            match self.establish(room_id).await {
                Ok((mut connection, mut subscriptions)) => {
                    self.set_status(ConnectionStatus::Connected);
                    let connected_at = Instant::now();
                    let exit = self
                        .pump(
                            connection.as_mut(),
                            &mut subscriptions,
                            &mut room_id,
                            &mut commands,
                            &mut resumed,
                        )
                        .await;
                    match exit {
                        PumpExit::Closed => {
                            let _ = connection.close().await;
                            self.set_status(ConnectionStatus::Disconnected);
                            info!(room_id = room_id.0, "realtime: channel closed");
                            return;
                        }
                        PumpExit::Dropped(reason) => {
                            warn!(room_id = room_id.0, "realtime: channel dropped: {reason}");
                        }
                    }
                    if connected_at.elapsed() >= self.policy.stable_after {
                        backoff.reset();
                    }
                    if std::mem::take(&mut resumed) {
                        info!(room_id = room_id.0, "realtime: reconnecting immediately after resume");
                        backoff.reset();
                        self.set_status(ConnectionStatus::Reconnecting);
                        continue;
                    }
                }
                Err(err) => {
                    warn!(room_id = room_id.0, "realtime: connection attempt failed: {err:#}");
                }
            }

            self.set_status(ConnectionStatus::Reconnecting);
            let delay = backoff.next_delay();
            info!(
                room_id = room_id.0,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "realtime: reconnect scheduled"
            );
            let _ = self.events.send(ClientEvent::ReconnectScheduled {
                attempt: backoff.attempt(),
                delay,
            });

            match self
                .wait_for_retry(delay, &mut room_id, &mut commands, &mut backoff)
                .await
            {
                RetryWait::Retry => {}
                RetryWait::Close => {
                    self.set_status(ConnectionStatus::Disconnected);
                    return;
                }
            }
        }
    }

    /// Handshake first, then a full resynchronization, then subscriptions.
    async fn establish(
        &self,
        room_id: RoomId,
    ) -> anyhow::Result<(Box<dyn PushConnection>, SubscriptionSet)> {
        let access_token = self
            .session
            .current_token()
            .await
            .context("no credential for push channel")?;
        let mut connection = self.connector.connect().await?;
        connection
            .send(ClientFrame::Authenticate { access_token })
            .await?;

        let handshake = tokio::time::timeout(
            self.policy.handshake_timeout,
            await_authenticated(connection.as_mut()),
        )
        .await
        .map_err(|_| anyhow!("handshake timed out"))?;
        let subject = match handshake {
            Ok(subject) => subject,
            Err(err) => {
                if let Err(refresh_err) = self.session.force_refresh().await {
                    warn!("realtime: credential refresh after rejected handshake failed: {refresh_err}");
                }
                return Err(err);
            }
        };

        self.engine
            .load_snapshot(room_id)
            .await
            .context("resynchronization failed")?;
        let subscriptions = SubscriptionSet::establish(connection.as_mut(), room_id).await?;
        info!(
            room_id = room_id.0,
            user_id = subject.0,
            "realtime: channel established"
        );
        Ok((connection, subscriptions))
    }

    async fn pump(
        &self,
        connection: &mut dyn PushConnection,
        subscriptions: &mut SubscriptionSet,
        room_id: &mut RoomId,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        resumed: &mut bool,
    ) -> PumpExit {
        loop {
            tokio::select! {
                frame = connection.recv() => match frame {
                    Ok(Some(ServerFrame::Event { topic, payload })) => {
                        self.handle_event(&topic, payload, subscriptions);
                    }
                    Ok(Some(ServerFrame::AuthRejected { reason })) => {
                        if let Err(err) = self.session.force_refresh().await {
                            warn!("realtime: credential refresh after revocation failed: {err}");
                        }
                        return PumpExit::Dropped(format!("credential rejected: {reason}"));
                    }
                    Ok(Some(ServerFrame::Error(error))) => {
                        warn!(code = ?error.code, "realtime: server reported error: {}", error.message);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return PumpExit::Dropped("closed by server".to_string()),
                    Err(err) => return PumpExit::Dropped(format!("{err:#}")),
                },
                command = commands.recv() => match command {
                    None | Some(Command::Close) => {
                        if let Err(err) = subscriptions.teardown(connection).await {
                            warn!("realtime: unsubscribe during close failed: {err:#}");
                        }
                        return PumpExit::Closed;
                    }
                    Some(Command::Foreground { hidden_for }) => {
                        if hidden_for > self.policy.foreground_threshold {
                            *resumed = true;
                        }
                    }
                    Some(Command::SwitchRoom { room_id: next, done }) => {
                        let switched = self.switch_subscriptions(connection, subscriptions, next).await;
                        *room_id = next;
                        let _ = done.send(());
                        if let Err(err) = switched {
                            return PumpExit::Dropped(format!("room switch failed: {err:#}"));
                        }
                    }
                },
            }
        }
    }

    async fn switch_subscriptions(
        &self,
        connection: &mut dyn PushConnection,
        subscriptions: &mut SubscriptionSet,
        next: RoomId,
    ) -> anyhow::Result<()> {
        subscriptions.teardown(connection).await?;
        self.engine
            .load_snapshot(next)
            .await
            .context("snapshot for new room failed")?;
        *subscriptions = SubscriptionSet::establish(connection, next).await?;
        info!(room_id = next.0, "realtime: switched room subscriptions");
        Ok(())
    }

    fn handle_event(&self, topic: &str, payload: serde_json::Value, subscriptions: &SubscriptionSet) {
        let Some(handler) = subscriptions.handler(topic) else {
            debug!(topic, "realtime: ignoring event for unsubscribed topic");
            return;
        };

        match handler {
            TopicHandler::RosterUpdate(room_id) => {
                match serde_json::from_value::<RosterPayload>(payload) {
                    Ok(roster) if roster.room_id == room_id => {
                        let _ = self.events.send(ClientEvent::RosterUpdated {
                            room_id,
                            members: roster.members,
                        });
                    }
                    Ok(roster) => {
                        debug!(topic, other_room = roster.room_id.0, "realtime: roster event for another room");
                    }
                    Err(err) => warn!(topic, "realtime: dropping malformed roster payload: {err}"),
                }
            }
            TopicHandler::GlobalUpdate(room_id) | TopicHandler::RoomUpdate(room_id) => {
                match serde_json::from_value::<PushPayload>(payload) {
                    Ok(update) if update.room_id == room_id => self.trigger_refresh(room_id),
                    Ok(update) => {
                        debug!(topic, other_room = update.room_id.0, "realtime: update for another room");
                    }
                    Err(err) => warn!(topic, "realtime: dropping malformed update payload: {err}"),
                }
            }
        }
    }

    fn trigger_refresh(&self, room_id: RoomId) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(err) = engine.refresh_delta().await {
                warn!(room_id = room_id.0, "realtime: push-triggered refresh failed: {err}");
            }
        });
    }

    async fn wait_for_retry(
        &self,
        delay: Duration,
        room_id: &mut RoomId,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        backoff: &mut Backoff,
    ) -> RetryWait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return RetryWait::Retry,
                command = commands.recv() => match command {
                    None | Some(Command::Close) => return RetryWait::Close,
                    Some(Command::Foreground { hidden_for }) => {
                        if hidden_for > self.policy.foreground_threshold {
                            info!(
                                hidden_ms = hidden_for.as_millis() as u64,
                                "realtime: foreground resume; reconnecting immediately"
                            );
                            backoff.reset();
                            return RetryWait::Retry;
                        }
                    }
                    Some(Command::SwitchRoom { room_id: next, done }) => {
                        *room_id = next;
                        if let Err(err) = self.engine.load_snapshot(next).await {
                            warn!(room_id = next.0, "realtime: snapshot while reconnecting failed: {err}");
                        }
                        let _ = done.send(());
                    }
                },
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "realtime: status changed");
            let _ = self.events.send(ClientEvent::StatusChanged(status));
        }
    }
}

async fn await_authenticated(connection: &mut dyn PushConnection) -> anyhow::Result<UserId> {
    loop {
        match connection.recv().await? {
            Some(ServerFrame::Authenticated { subject }) => return Ok(subject),
            Some(ServerFrame::AuthRejected { reason }) => {
                return Err(anyhow!("push channel rejected credential: {reason}"))
            }
            Some(_) => {}
            None => return Err(anyhow!("push channel closed during handshake")),
        }
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
