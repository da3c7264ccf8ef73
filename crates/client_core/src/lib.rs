use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{ClientKey, RoomId, SurveyId},
    protocol::{MemberSummary, ProgressRecord},
};
use storage::KeyValueStore;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

pub mod api;
pub mod config;
pub mod error;
pub mod outbox;
pub mod progress;
pub mod realtime;
pub mod reconcile;
pub mod session;

pub use api::{AuthBackend, HttpAuthBackend, HttpMessageApi, MessageApi};
pub use config::{load_settings, ClientSettings};
pub use error::ClientError;
pub use outbox::OptimisticSender;
pub use progress::ProgressTracker;
pub use realtime::{
    Backoff, ChannelSupervisor, ConnectionStatus, PushConnection, PushConnector, ReconnectPolicy,
    WsConnector,
};
pub use reconcile::{Message, MessageIdentity, MessageLog, ReconciliationEngine};
pub use session::{Identity, RefreshPolicy, SessionManager};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    StatusChanged(ConnectionStatus),
    RosterUpdated {
        room_id: RoomId,
        members: Vec<MemberSummary>,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// The draft of a send that was rolled back, for re-entry.
    SendFailed {
        draft: String,
    },
    Error(String),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn sign_in(&self, username: &str) -> Result<Identity, ClientError>;
    async fn sign_out(&self);
    async fn join_room(&self, room_id: RoomId) -> Result<(), ClientError>;
    async fn send(&self, draft: &str) -> Result<ClientKey, ClientError>;
    async fn send_survey(&self, survey_id: SurveyId) -> Result<ClientKey, ClientError>;
    async fn load_older(&self) -> Result<usize, ClientError>;
    async fn current_messages(&self) -> Vec<Message>;
    fn connection_status(&self) -> ConnectionStatus;
    async fn notify_foreground(&self, hidden_for: Duration);
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
    fn subscribe_messages(&self) -> watch::Receiver<Vec<Message>>;
}

pub struct RealtimeClient {
    session: Arc<SessionManager>,
    api: Arc<dyn MessageApi>,
    engine: Arc<ReconciliationEngine>,
    supervisor: Arc<ChannelSupervisor>,
    outbox: OptimisticSender,
    progress: ProgressTracker,
    page_size: u32,
    events: broadcast::Sender<ClientEvent>,
}

impl RealtimeClient {
    pub fn new(
        settings: &ClientSettings,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Arc<Self>, ClientError> {
        let http = Client::new();
        let auth = HttpAuthBackend::new(http.clone(), settings.server_url.clone());
        let session = SessionManager::new(Arc::new(auth), settings.refresh_policy());
        let api = HttpMessageApi::new(http, settings.server_url.clone(), Arc::clone(&session));
        let connector = WsConnector::from_server_url(&settings.server_url)?;
        Ok(Self::new_with_dependencies(
            session,
            Arc::new(api),
            Arc::new(connector),
            store,
            settings,
        ))
    }

    pub fn new_with_dependencies(
        session: Arc<SessionManager>,
        api: Arc<dyn MessageApi>,
        connector: Arc<dyn PushConnector>,
        store: Arc<dyn KeyValueStore>,
        settings: &ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let engine = ReconciliationEngine::new(Arc::clone(&api));
        let supervisor = ChannelSupervisor::new(
            connector,
            Arc::clone(&session),
            Arc::clone(&engine),
            settings.reconnect_policy(),
            events.clone(),
        );
        let outbox = OptimisticSender::new(
            Arc::clone(&api),
            Arc::clone(&session),
            Arc::clone(&engine),
            events.clone(),
        );
        let progress = ProgressTracker::new(Arc::clone(&api), store);
        Arc::new(Self {
            session,
            api,
            engine,
            supervisor,
            outbox,
            progress,
            page_size: settings.page_size,
            events,
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub async fn active_room(&self) -> Option<RoomId> {
        self.engine.active_room().await
    }

    /// Locally stored page for the active room, available before any network call.
    pub async fn cached_progress(&self) -> Option<i64> {
        let room_id = self.engine.active_room().await?;
        let identity = self.session.identity().await?;
        self.progress.cached(room_id, identity.user_id).await
    }

    pub async fn refresh_progress(&self) -> Result<Option<ProgressRecord>, ClientError> {
        let (room_id, identity) = self.room_and_identity().await?;
        self.progress.refresh(room_id, identity.user_id).await
    }

    pub async fn save_progress(&self, page: i64, comment: Option<String>) -> Result<(), ClientError> {
        let (room_id, identity) = self.room_and_identity().await?;
        self.progress
            .save(ProgressRecord {
                room_id,
                user_id: identity.user_id,
                page,
                comment,
            })
            .await
    }

    /// Stops the push channel and the refresh scheduler. The credential stays cached.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        self.session.shutdown().await;
        info!("client: shut down");
    }

    async fn room_and_identity(&self) -> Result<(RoomId, Identity), ClientError> {
        let room_id = self
            .engine
            .active_room()
            .await
            .ok_or(ClientError::NoActiveRoom)?;
        let identity = self.session.identity().await.ok_or(ClientError::NotSignedIn)?;
        Ok((room_id, identity))
    }
}

#[async_trait]
impl ClientHandle for Arc<RealtimeClient> {
    async fn sign_in(&self, username: &str) -> Result<Identity, ClientError> {
        self.session.sign_in(username).await
    }

    async fn sign_out(&self) {
        self.supervisor.shutdown().await;
        self.session.sign_out().await;
        self.engine.reset().await;
    }

    /// Joins (an existing membership is fine) and moves the push channel and
    /// the message log to `room_id`.
    async fn join_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        if let Err(err) = self.api.join_room(room_id).await {
            warn!(room_id = room_id.0, "client: join failed: {err}");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("join room {} failed: {err}", room_id.0)));
            return Err(err);
        }
        self.engine.activate(room_id).await;
        self.supervisor.connect(room_id).await;
        Ok(())
    }

    async fn send(&self, draft: &str) -> Result<ClientKey, ClientError> {
        self.outbox.send(draft).await
    }

    async fn send_survey(&self, survey_id: SurveyId) -> Result<ClientKey, ClientError> {
        self.outbox.send_survey(survey_id).await
    }

    /// Returns the number of entries prepended; zero when nothing older is known.
    async fn load_older(&self) -> Result<usize, ClientError> {
        let Some(before) = self.engine.oldest_server_id().await else {
            return Ok(0);
        };
        self.engine.load_older(before, self.page_size).await
    }

    async fn current_messages(&self) -> Vec<Message> {
        self.engine.current_messages().await
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.supervisor.status()
    }

    async fn notify_foreground(&self, hidden_for: Duration) {
        self.supervisor.notify_foreground(hidden_for).await;
        if self.session.identity().await.is_some() {
            if let Err(err) = self.session.ensure_fresh().await {
                warn!("client: refresh after resume failed: {err}");
            }
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn subscribe_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.engine.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
