//! Optimistic sends: the pending entry is visible before the server answers
//! and is rolled back if the send fails.

use std::sync::Arc;

use shared::{
    domain::{ClientKey, MessageKind, SurveyId},
    protocol::SendMessageRequest,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    api::MessageApi,
    error::ClientError,
    reconcile::{Message, ReconciliationEngine},
    session::SessionManager,
    ClientEvent,
};

const FALLBACK_SENDER_NAME: &str = "me";

pub struct OptimisticSender {
    api: Arc<dyn MessageApi>,
    session: Arc<SessionManager>,
    engine: Arc<ReconciliationEngine>,
    events: broadcast::Sender<ClientEvent>,
}

impl OptimisticSender {
    pub fn new(
        api: Arc<dyn MessageApi>,
        session: Arc<SessionManager>,
        engine: Arc<ReconciliationEngine>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            session,
            engine,
            events,
        }
    }

    /// Returns the client key of the pending entry once the server accepted it.
    /// The entry stays pending until a later merge brings the confirmed record.
    pub async fn send(&self, draft: &str) -> Result<ClientKey, ClientError> {
        if draft.trim().is_empty() {
            return Err(ClientError::EmptyDraft);
        }
        self.submit(draft, MessageKind::Text, None).await
    }

    pub async fn send_survey(&self, survey_id: SurveyId) -> Result<ClientKey, ClientError> {
        self.submit("", MessageKind::Survey, Some(survey_id)).await
    }

    async fn submit(
        &self,
        draft: &str,
        kind: MessageKind,
        survey_id: Option<SurveyId>,
    ) -> Result<ClientKey, ClientError> {
        let room_id = self
            .engine
            .active_room()
            .await
            .ok_or(ClientError::NoActiveRoom)?;

        let identity = match self.resolve_identity().await {
            Ok(identity) => identity,
            Err(source) => return Err(self.fail(draft, source)),
        };

        let pending = Message::local_pending(
            room_id,
            identity.user_id,
            identity
                .display_name
                .unwrap_or_else(|| FALLBACK_SENDER_NAME.to_string()),
            draft,
            kind,
            survey_id,
        );
        let client_key = pending.client_key.clone();
        if !self.engine.append_pending(pending).await {
            return Err(ClientError::NoActiveRoom);
        }

        let request = SendMessageRequest {
            room_id,
            client_key: client_key.clone(),
            content: draft.to_string(),
            kind,
            survey_id,
        };
        match self.api.send_message(&request).await {
            Ok(response) => {
                info!(
                    room_id = room_id.0,
                    message_id = response.message_id.0,
                    client_key = %client_key,
                    "outbox: message accepted"
                );
                Ok(client_key)
            }
            Err(source) => {
                self.engine.remove_pending(room_id, &client_key).await;
                warn!(
                    room_id = room_id.0,
                    client_key = %client_key,
                    "outbox: send failed; pending entry reverted: {source}"
                );
                Err(self.fail(draft, source))
            }
        }
    }

    /// Uses the cached identity so the echo never waits on a refresh; the
    /// authorized send keeps the credential fresh. Only a session with no
    /// credential at all provisions one first.
    async fn resolve_identity(&self) -> Result<crate::session::Identity, ClientError> {
        if let Some(identity) = self.session.identity().await {
            return Ok(identity);
        }
        self.session.ensure_fresh().await?;
        self.session.identity().await.ok_or(ClientError::NotSignedIn)
    }

    fn fail(&self, draft: &str, source: ClientError) -> ClientError {
        let _ = self.events.send(ClientEvent::SendFailed {
            draft: draft.to_string(),
        });
        ClientError::SendFailed {
            draft: draft.to_string(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
