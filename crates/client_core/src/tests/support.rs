//! In-process fakes for the network seams.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{MessageId, MessageKind, RoomId, UserId},
    protocol::{
        ClientFrame, MessageRecord, ProgressRecord, SendMessageRequest, SendMessageResponse,
        ServerFrame, TokenResponse,
    },
};
use tokio::{
    sync::{mpsc, Notify},
    time::Instant,
};

use crate::{
    api::{AuthBackend, MessageApi},
    error::ClientError,
    realtime::{PushConnection, PushConnector},
    session::{RefreshPolicy, SessionManager},
};

/// Ordered record of observable calls across fakes.
#[derive(Clone, Default)]
pub struct Journal(Arc<StdMutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("journal lock").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("journal lock").clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|existing| existing == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .filter(|existing| existing.as_str() == entry)
            .count()
    }
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub fn record(id: i64, room: i64, sender: i64, seconds: i64) -> MessageRecord {
    MessageRecord {
        message_id: Some(MessageId(id)),
        client_key: None,
        room_id: RoomId(room),
        sender_id: UserId(sender),
        sender_name: format!("user-{sender}"),
        content: format!("message {id}"),
        sent_at: at(seconds),
        kind: MessageKind::Text,
        survey_id: None,
    }
}

pub fn token(subject: i64, label: &str, valid_for: chrono::Duration) -> TokenResponse {
    TokenResponse {
        access_token: format!("{label}-{subject}"),
        subject: UserId(subject),
        display_name: Some(format!("{label} {subject}")),
        expires_at: Some(Utc::now() + valid_for),
    }
}

/// Polls `check` on a short timer until it holds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition did not hold in time");
}

#[derive(Default)]
pub struct FakeAuth {
    pub issue_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub guest_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    refresh_results: StdMutex<VecDeque<Result<TokenResponse, ClientError>>>,
    guest_results: StdMutex<VecDeque<Result<TokenResponse, ClientError>>>,
    refresh_delay: StdMutex<Duration>,
    next_guest: AtomicI64,
}

impl FakeAuth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_guest: AtomicI64::new(900),
            ..Self::default()
        })
    }

    pub fn push_refresh(&self, result: Result<TokenResponse, ClientError>) {
        self.refresh_results
            .lock()
            .expect("refresh results lock")
            .push_back(result);
    }

    pub fn push_guest(&self, result: Result<TokenResponse, ClientError>) {
        self.guest_results
            .lock()
            .expect("guest results lock")
            .push_back(result);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().expect("refresh delay lock") = delay;
    }
}

#[async_trait]
impl AuthBackend for FakeAuth {
    async fn issue(&self, username: &str) -> Result<TokenResponse, ClientError> {
        self.issue_calls.fetch_add(1, Ordering::SeqCst);
        let mut response = token(1, "issued", chrono::Duration::hours(1));
        response.display_name = Some(username.to_string());
        Ok(response)
    }

    async fn refresh(&self, access_token: &str) -> Result<TokenResponse, ClientError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock().expect("refresh delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let queued = self
            .refresh_results
            .lock()
            .expect("refresh results lock")
            .pop_front();
        queued.unwrap_or_else(|| {
            let subject = access_token
                .rsplit('-')
                .next()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(1);
            Ok(token(subject, "refreshed", chrono::Duration::hours(1)))
        })
    }

    async fn provision_guest(&self) -> Result<TokenResponse, ClientError> {
        self.guest_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self
            .guest_results
            .lock()
            .expect("guest results lock")
            .pop_front();
        queued.unwrap_or_else(|| {
            let subject = self.next_guest.fetch_add(1, Ordering::SeqCst);
            Ok(token(subject, "guest", chrono::Duration::hours(1)))
        })
    }

    async fn revoke(&self, _access_token: &str) -> Result<(), ClientError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub async fn signed_in(auth: Arc<FakeAuth>) -> Arc<SessionManager> {
    let session = SessionManager::new(auth, RefreshPolicy::default());
    session.sign_in("alice").await.expect("sign in");
    session
}

#[derive(Default)]
pub struct FakeMessageApi {
    pub journal: Journal,
    pub history_calls: AtomicUsize,
    pub sent: StdMutex<Vec<SendMessageRequest>>,
    pub joined: StdMutex<Vec<RoomId>>,
    history: StdMutex<HashMap<RoomId, Vec<MessageRecord>>>,
    fail_sends: StdMutex<Option<ClientError>>,
    /// Confirmed sends are added to the room history.
    echo_sends: std::sync::atomic::AtomicBool,
    older_gate: StdMutex<Option<Arc<Notify>>>,
    progress: StdMutex<HashMap<(RoomId, UserId), ProgressRecord>>,
    next_id: AtomicI64,
}

impl FakeMessageApi {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            next_id: AtomicI64::new(1000),
            ..Self::default()
        })
    }

    pub fn set_history(&self, room_id: RoomId, records: Vec<MessageRecord>) {
        self.history
            .lock()
            .expect("history lock")
            .insert(room_id, records);
    }

    pub fn push_history(&self, room_id: RoomId, record: MessageRecord) {
        self.history
            .lock()
            .expect("history lock")
            .entry(room_id)
            .or_default()
            .push(record);
    }

    pub fn fail_sends_with(&self, err: ClientError) {
        *self.fail_sends.lock().expect("fail sends lock") = Some(err);
    }

    pub fn echo_sends(&self) {
        self.echo_sends.store(true, Ordering::SeqCst);
    }

    /// Holds every `fetch_before` until the returned gate is notified.
    pub fn gate_older_pages(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.older_gate.lock().expect("older gate lock") = Some(Arc::clone(&gate));
        gate
    }

    pub fn set_progress(&self, record: ProgressRecord) {
        self.progress
            .lock()
            .expect("progress lock")
            .insert((record.room_id, record.user_id), record);
    }

    pub fn progress(&self, room_id: RoomId, user_id: UserId) -> Option<ProgressRecord> {
        self.progress
            .lock()
            .expect("progress lock")
            .get(&(room_id, user_id))
            .cloned()
    }
}

#[async_trait]
impl MessageApi for FakeMessageApi {
    async fn fetch_history(&self, room_id: RoomId) -> Result<Vec<MessageRecord>, ClientError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.journal.push(format!("fetch_history:{}", room_id.0));
        Ok(self
            .history
            .lock()
            .expect("history lock")
            .get(&room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_before(
        &self,
        room_id: RoomId,
        before: MessageId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, ClientError> {
        let gate = self.older_gate.lock().expect("older gate lock").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.journal
            .push(format!("fetch_before:{}:{}", room_id.0, before.0));
        let history = self
            .history
            .lock()
            .expect("history lock")
            .get(&room_id)
            .cloned()
            .unwrap_or_default();
        let older: Vec<MessageRecord> = history
            .into_iter()
            .filter(|record| record.message_id.is_some_and(|id| id < before))
            .collect();
        let skip = older.len().saturating_sub(limit as usize);
        Ok(older.into_iter().skip(skip).collect())
    }

    async fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ClientError> {
        self.journal.push(format!("send:{}", request.room_id.0));
        self.sent.lock().expect("sent lock").push(request.clone());
        if let Some(err) = self.fail_sends.lock().expect("fail sends lock").clone() {
            return Err(err);
        }
        let message_id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let sent_at = Utc::now();
        if self.echo_sends.load(Ordering::SeqCst) {
            self.push_history(
                request.room_id,
                MessageRecord {
                    message_id: Some(message_id),
                    client_key: Some(request.client_key.clone()),
                    room_id: request.room_id,
                    sender_id: UserId(1),
                    sender_name: "alice".to_string(),
                    content: request.content.clone(),
                    sent_at,
                    kind: request.kind,
                    survey_id: request.survey_id,
                },
            );
        }
        Ok(SendMessageResponse {
            message_id,
            sent_at,
        })
    }

    async fn fetch_progress(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<ProgressRecord>, ClientError> {
        Ok(self.progress(room_id, user_id))
    }

    async fn update_progress(&self, record: &ProgressRecord) -> Result<(), ClientError> {
        self.set_progress(record.clone());
        Ok(())
    }

    async fn join_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        self.journal.push(format!("join:{}", room_id.0));
        self.joined.lock().expect("joined lock").push(room_id);
        Ok(())
    }
}

/// Test-side handle of an accepted push connection. Dropping `events` closes it.
pub struct ScriptedConnection {
    pub events: mpsc::UnboundedSender<ServerFrame>,
}

enum ConnectOutcome {
    Refuse,
    Accept {
        incoming: mpsc::UnboundedReceiver<ServerFrame>,
        reject_auth: bool,
    },
}

pub struct FakeConnector {
    journal: Journal,
    subject: UserId,
    outcomes: StdMutex<VecDeque<ConnectOutcome>>,
    attempts: StdMutex<Vec<Instant>>,
}

impl FakeConnector {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            subject: UserId(1),
            outcomes: StdMutex::new(VecDeque::new()),
            attempts: StdMutex::new(Vec::new()),
        })
    }

    pub fn accept(&self) -> ScriptedConnection {
        self.enqueue_accept(false)
    }

    pub fn accept_then_reject_auth(&self) -> ScriptedConnection {
        self.enqueue_accept(true)
    }

    pub fn refuse(&self) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .push_back(ConnectOutcome::Refuse);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().expect("attempts lock").clone()
    }

    fn enqueue_accept(&self, reject_auth: bool) -> ScriptedConnection {
        let (events, incoming) = mpsc::unbounded_channel();
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .push_back(ConnectOutcome::Accept {
                incoming,
                reject_auth,
            });
        ScriptedConnection { events }
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self) -> anyhow::Result<Box<dyn PushConnection>> {
        self.attempts
            .lock()
            .expect("attempts lock")
            .push(Instant::now());
        self.journal.push("connect");
        let outcome = self.outcomes.lock().expect("outcomes lock").pop_front();
        match outcome {
            Some(ConnectOutcome::Accept {
                incoming,
                reject_auth,
            }) => Ok(Box::new(FakeConnection {
                journal: self.journal.clone(),
                subject: self.subject,
                reject_auth,
                replies: VecDeque::new(),
                incoming,
            })),
            Some(ConnectOutcome::Refuse) | None => Err(anyhow!("connection refused")),
        }
    }
}

struct FakeConnection {
    journal: Journal,
    subject: UserId,
    reject_auth: bool,
    replies: VecDeque<ServerFrame>,
    incoming: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
impl PushConnection for FakeConnection {
    async fn send(&mut self, frame: ClientFrame) -> anyhow::Result<()> {
        match frame {
            ClientFrame::Authenticate { .. } => {
                self.journal.push("authenticate");
                let reply = if self.reject_auth {
                    ServerFrame::AuthRejected {
                        reason: "expired".to_string(),
                    }
                } else {
                    ServerFrame::Authenticated {
                        subject: self.subject,
                    }
                };
                self.replies.push_back(reply);
            }
            ClientFrame::Subscribe { topic } => {
                self.journal.push(format!("subscribe:{topic}"));
                self.replies.push_back(ServerFrame::Subscribed { topic });
            }
            ClientFrame::Unsubscribe { topic } => {
                self.journal.push(format!("unsubscribe:{topic}"));
            }
            ClientFrame::Ping => self.replies.push_back(ServerFrame::Pong),
        }
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<Option<ServerFrame>> {
        if let Some(reply) = self.replies.pop_front() {
            return Ok(Some(reply));
        }
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.journal.push("close");
        Ok(())
    }
}
