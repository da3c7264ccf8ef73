use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use shared::{
    domain::{MessageId, RoomId, UserId},
    error::ApiError,
    protocol::{
        MessageRecord, ProgressRecord, RefreshRequest, SendMessageRequest, SendMessageResponse,
        SignInRequest, TokenResponse,
    },
};
use tracing::{info, warn};

use crate::{error::ClientError, session::SessionManager};

/// Credential issuance endpoints.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn issue(&self, username: &str) -> Result<TokenResponse, ClientError>;
    async fn refresh(&self, access_token: &str) -> Result<TokenResponse, ClientError>;
    /// Brand-new disposable identity, used when a refresh cannot be honoured.
    async fn provision_guest(&self) -> Result<TokenResponse, ClientError>;
    async fn revoke(&self, access_token: &str) -> Result<(), ClientError>;
}

/// Authenticated request/response calls against the room service.
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn fetch_history(&self, room_id: RoomId) -> Result<Vec<MessageRecord>, ClientError>;
    async fn fetch_before(
        &self,
        room_id: RoomId,
        before: MessageId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, ClientError>;
    async fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ClientError>;
    async fn fetch_progress(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<ProgressRecord>, ClientError>;
    async fn update_progress(&self, record: &ProgressRecord) -> Result<(), ClientError>;
    async fn join_room(&self, room_id: RoomId) -> Result<(), ClientError>;
}

async fn checked(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    match response.json::<ApiError>().await {
        Ok(api_error) => Err(ClientError::from_api_error(code, api_error)),
        Err(_) => Err(ClientError::rejected(
            code,
            status.canonical_reason().unwrap_or("unexpected status"),
        )),
    }
}

fn trim_base(server_url: impl Into<String>) -> String {
    server_url.into().trim_end_matches('/').to_string()
}

pub struct HttpAuthBackend {
    http: Client,
    server_url: String,
}

impl HttpAuthBackend {
    pub fn new(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: trim_base(server_url),
        }
    }

    async fn post_token<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<TokenResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}{path}", self.server_url))
            .json(body)
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn issue(&self, username: &str) -> Result<TokenResponse, ClientError> {
        self.post_token(
            "/auth/sign_in",
            &SignInRequest {
                username: username.to_string(),
            },
        )
        .await
    }

    async fn refresh(&self, access_token: &str) -> Result<TokenResponse, ClientError> {
        self.post_token(
            "/auth/refresh",
            &RefreshRequest {
                access_token: access_token.to_string(),
            },
        )
        .await
    }

    async fn provision_guest(&self) -> Result<TokenResponse, ClientError> {
        self.post_token("/auth/guest", &serde_json::json!({})).await
    }

    async fn revoke(&self, access_token: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/auth/revoke", self.server_url))
            .bearer_auth(access_token)
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct PageQuery {
    before: i64,
    limit: u32,
}

pub struct HttpMessageApi {
    http: Client,
    server_url: String,
    session: Arc<SessionManager>,
}

impl HttpMessageApi {
    pub fn new(http: Client, server_url: impl Into<String>, session: Arc<SessionManager>) -> Self {
        Self {
            http,
            server_url: trim_base(server_url),
            session,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    /// Attaches the current credential; a 401 forces one refresh and one retry.
    async fn send_authorized<F>(&self, build: F) -> Result<Response, ClientError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let token = self.session.current_token().await?;
        let response = build().bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return checked(response).await;
        }

        warn!("api: request unauthorized; forcing credential refresh before retry");
        self.session.force_refresh().await?;
        let token = self.session.current_token().await?;
        let response = build().bearer_auth(&token).send().await?;
        checked(response).await
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn fetch_history(&self, room_id: RoomId) -> Result<Vec<MessageRecord>, ClientError> {
        let url = self.url(&format!("/rooms/{}/messages", room_id.0));
        let response = self.send_authorized(|| self.http.get(&url)).await?;
        Ok(response.json().await?)
    }

    async fn fetch_before(
        &self,
        room_id: RoomId,
        before: MessageId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, ClientError> {
        let url = self.url(&format!("/rooms/{}/messages", room_id.0));
        let query = PageQuery {
            before: before.0,
            limit,
        };
        let response = self
            .send_authorized(|| self.http.get(&url).query(&query))
            .await?;
        Ok(response.json().await?)
    }

    async fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ClientError> {
        let url = self.url(&format!("/rooms/{}/messages", request.room_id.0));
        let response = self
            .send_authorized(|| self.http.post(&url).json(request))
            .await?;
        Ok(response.json().await?)
    }

    async fn fetch_progress(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<ProgressRecord>, ClientError> {
        let url = self.url(&format!("/rooms/{}/progress/{}", room_id.0, user_id.0));
        match self.send_authorized(|| self.http.get(&url)).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(ClientError::Rejected { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn update_progress(&self, record: &ProgressRecord) -> Result<(), ClientError> {
        let url = self.url(&format!(
            "/rooms/{}/progress/{}",
            record.room_id.0, record.user_id.0
        ));
        self.send_authorized(|| self.http.put(&url).json(record))
            .await?;
        Ok(())
    }

    async fn join_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        let url = self.url(&format!("/rooms/{}/join", room_id.0));
        match self.send_authorized(|| self.http.post(&url)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_benign_conflict() => {
                info!(room_id = room_id.0, "api: already a member of room");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
