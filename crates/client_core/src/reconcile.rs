//! Canonical per-room message log.
//!
//! Snapshots replace the log wholesale, deltas only add identities that are
//! not yet present, and older pages are prepended. The log stays sorted by
//! `(sent_at, identity)` after every merge.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::{
    domain::{ClientKey, MessageId, MessageKind, MessageOrigin, RoomId, SurveyId, UserId},
    protocol::MessageRecord,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{api::MessageApi, error::ClientError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageIdentity {
    Server(MessageId),
    Client(ClientKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub server_id: Option<MessageId>,
    pub client_key: ClientKey,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub kind: MessageKind,
    pub survey_ref: Option<SurveyId>,
    pub origin: MessageOrigin,
}

impl Message {
    pub fn from_record(record: MessageRecord, position: usize, local_nanos: i64) -> Self {
        let client_key = record
            .client_key
            .unwrap_or_else(|| ClientKey::fallback(position, local_nanos));
        // Survey content is resolved through `survey_ref`.
        let body = match record.kind {
            MessageKind::Survey => String::new(),
            MessageKind::Text => record.content,
        };
        Self {
            server_id: record.message_id,
            client_key,
            room_id: record.room_id,
            sender_id: record.sender_id,
            sender_name: record.sender_name,
            body,
            sent_at: record.sent_at,
            kind: record.kind,
            survey_ref: record.survey_id,
            origin: MessageOrigin::Server,
        }
    }

    pub fn local_pending(
        room_id: RoomId,
        sender_id: UserId,
        sender_name: impl Into<String>,
        body: impl Into<String>,
        kind: MessageKind,
        survey_ref: Option<SurveyId>,
    ) -> Self {
        Self {
            server_id: None,
            client_key: ClientKey::generate(),
            room_id,
            sender_id,
            sender_name: sender_name.into(),
            body: match kind {
                MessageKind::Survey => String::new(),
                MessageKind::Text => body.into(),
            },
            sent_at: Utc::now(),
            kind,
            survey_ref,
            origin: MessageOrigin::LocalPending,
        }
    }

    pub fn identity(&self) -> MessageIdentity {
        match self.server_id {
            Some(id) => MessageIdentity::Server(id),
            None => MessageIdentity::Client(self.client_key.clone()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.origin == MessageOrigin::LocalPending
    }
}

/// Orders by `sent_at`, then by identity; server ids sort before client keys.
pub fn compare_messages(a: &Message, b: &Message) -> Ordering {
    a.sent_at
        .cmp(&b.sent_at)
        .then_with(|| match (a.server_id, b.server_id) {
            (Some(left), Some(right)) => left.cmp(&right),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.client_key.cmp(&b.client_key),
        })
}

pub fn canonicalize(records: Vec<MessageRecord>) -> Vec<Message> {
    let local_nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    records
        .into_iter()
        .enumerate()
        .map(|(position, record)| Message::from_record(record, position, local_nanos))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub promoted: usize,
    pub swept: usize,
    pub skipped: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.promoted > 0 || self.swept > 0
    }

    fn absorb(&mut self, other: MergeOutcome) {
        self.inserted += other.inserted;
        self.promoted += other.promoted;
        self.swept += other.swept;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
    identities: HashSet<MessageIdentity>,
    high_water_mark: Option<DateTime<Utc>>,
}

impl MessageLog {
    pub fn from_snapshot(messages: Vec<Message>) -> Self {
        let mut log = Self::default();
        for message in messages {
            if log.identities.insert(message.identity()) {
                log.raise_high_water_mark(&message);
                log.entries.push(message);
            }
        }
        log.entries.sort_by(compare_messages);
        log
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: &MessageIdentity) -> bool {
        self.identities.contains(identity)
    }

    /// Newest server-confirmed `sent_at` incorporated so far.
    pub fn high_water_mark(&self) -> Option<DateTime<Utc>> {
        self.high_water_mark
    }

    pub fn oldest_server_id(&self) -> Option<MessageId> {
        self.entries.iter().find_map(|message| message.server_id)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|message| message.is_pending()).count()
    }

    /// Merges newer records. Records without a server id cannot be matched by
    /// identity across deliveries, so they must be newer than the high-water mark.
    pub fn apply_delta(&mut self, incoming: Vec<Message>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut batch_identities = HashSet::new();
        let mut accepted = Vec::with_capacity(incoming.len());

        for message in incoming {
            if message.server_id.is_none()
                && self
                    .high_water_mark
                    .is_some_and(|high_water_mark| message.sent_at <= high_water_mark)
            {
                outcome.skipped += 1;
                continue;
            }
            let identity = message.identity();
            if self.identities.contains(&identity) || !batch_identities.insert(identity) {
                outcome.skipped += 1;
                continue;
            }
            accepted.push(message);
        }

        let confirmed_keys: HashSet<ClientKey> = accepted
            .iter()
            .filter(|message| !message.is_pending())
            .map(|message| message.client_key.clone())
            .collect();
        let confirmed_senders: HashSet<UserId> = accepted
            .iter()
            .filter(|message| !message.is_pending())
            .map(|message| message.sender_id)
            .collect();

        let identities = &mut self.identities;
        self.entries.retain(|existing| {
            if !existing.is_pending() {
                return true;
            }
            if confirmed_keys.contains(&existing.client_key) {
                outcome.promoted += 1;
            } else if confirmed_senders.contains(&existing.sender_id) {
                outcome.swept += 1;
            } else {
                return true;
            }
            identities.remove(&existing.identity());
            false
        });

        outcome.inserted = accepted.len();
        self.insert_sorted_tail(accepted);
        outcome
    }

    /// Prepends an older page. Returns the number of new entries.
    pub fn merge_older(&mut self, incoming: Vec<Message>) -> usize {
        let mut older: Vec<Message> = Vec::with_capacity(incoming.len());
        for message in incoming {
            if self.identities.insert(message.identity()) {
                self.raise_high_water_mark(&message);
                older.push(message);
            }
        }
        if older.is_empty() {
            return 0;
        }
        older.sort_by(compare_messages);
        let count = older.len();

        let fits_before = match (older.last(), self.entries.first()) {
            (Some(last), Some(first)) => compare_messages(last, first) != Ordering::Greater,
            _ => true,
        };
        if fits_before {
            self.entries.splice(0..0, older);
        } else {
            self.entries.extend(older);
            self.entries.sort_by(compare_messages);
        }
        count
    }

    pub fn append_pending(&mut self, message: Message) -> bool {
        if !self.identities.insert(message.identity()) {
            return false;
        }
        self.insert_sorted_tail(vec![message]);
        true
    }

    pub fn remove_pending(&mut self, client_key: &ClientKey) -> bool {
        let Some(index) = self
            .entries
            .iter()
            .position(|message| message.is_pending() && &message.client_key == client_key)
        else {
            return false;
        };
        let removed = self.entries.remove(index);
        self.identities.remove(&removed.identity());
        true
    }

    pub fn sweep_pending(&mut self, sender_id: UserId) -> usize {
        let before = self.entries.len();
        let identities = &mut self.identities;
        self.entries.retain(|message| {
            let sweep = message.is_pending() && message.sender_id == sender_id;
            if sweep {
                identities.remove(&message.identity());
            }
            !sweep
        });
        before - self.entries.len()
    }

    /// Appends `incoming` and re-sorts from the first position it can affect.
    fn insert_sorted_tail(&mut self, mut incoming: Vec<Message>) {
        if incoming.is_empty() {
            return;
        }
        incoming.sort_by(compare_messages);
        let start = self
            .entries
            .partition_point(|existing| compare_messages(existing, &incoming[0]) == Ordering::Less);
        for message in &incoming {
            self.identities.insert(message.identity());
            self.raise_high_water_mark(message);
        }
        self.entries.extend(incoming);
        self.entries[start..].sort_by(compare_messages);
    }

    fn raise_high_water_mark(&mut self, message: &Message) {
        if message.is_pending() {
            return;
        }
        if self
            .high_water_mark
            .map_or(true, |current| message.sent_at > current)
        {
            self.high_water_mark = Some(message.sent_at);
        }
    }
}

/// Active room plus the switch generation it was activated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomTicket {
    pub room_id: RoomId,
    pub generation: u64,
}

#[derive(Default)]
struct EngineState {
    active_room: Option<RoomId>,
    generation: u64,
    log: MessageLog,
}

impl EngineState {
    fn ticket(&self) -> Option<RoomTicket> {
        self.active_room.map(|room_id| RoomTicket {
            room_id,
            generation: self.generation,
        })
    }

    fn is_current(&self, ticket: RoomTicket) -> bool {
        self.ticket() == Some(ticket)
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<MergeOutcome, ClientError>>>;

struct InflightRefresh {
    flight: SharedRefresh,
    rerun: Arc<AtomicBool>,
}

pub struct ReconciliationEngine {
    api: Arc<dyn MessageApi>,
    state: Mutex<EngineState>,
    inflight: Mutex<HashMap<RoomTicket, InflightRefresh>>,
    updates: watch::Sender<Vec<Message>>,
}

impl ReconciliationEngine {
    pub fn new(api: Arc<dyn MessageApi>) -> Arc<Self> {
        let (updates, _) = watch::channel(Vec::new());
        Arc::new(Self {
            api,
            state: Mutex::new(EngineState::default()),
            inflight: Mutex::new(HashMap::new()),
            updates,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.updates.subscribe()
    }

    pub async fn current_messages(&self) -> Vec<Message> {
        self.state.lock().await.log.entries().to_vec()
    }

    pub async fn active_room(&self) -> Option<RoomId> {
        self.state.lock().await.active_room
    }

    pub async fn ticket(&self) -> Option<RoomTicket> {
        self.state.lock().await.ticket()
    }

    pub async fn high_water_mark(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.log.high_water_mark()
    }

    pub async fn oldest_server_id(&self) -> Option<MessageId> {
        self.state.lock().await.log.oldest_server_id()
    }

    /// Makes `room_id` active. Switching rooms clears the log and invalidates
    /// every ticket issued for the previous room.
    pub async fn activate(&self, room_id: RoomId) -> RoomTicket {
        let mut guard = self.state.lock().await;
        if guard.active_room != Some(room_id) {
            guard.active_room = Some(room_id);
            guard.generation += 1;
            guard.log = MessageLog::default();
            self.publish(&guard.log);
            info!(room_id = room_id.0, generation = guard.generation, "reconcile: room activated");
        }
        RoomTicket {
            room_id,
            generation: guard.generation,
        }
    }

    pub async fn reset(&self) {
        let mut guard = self.state.lock().await;
        guard.active_room = None;
        guard.generation += 1;
        guard.log = MessageLog::default();
        self.publish(&guard.log);
    }

    /// Replaces the room's log with the fetched history. Returns `None` when the
    /// room stopped being active before the fetch completed.
    pub async fn load_snapshot(&self, room_id: RoomId) -> Result<Option<usize>, ClientError> {
        let ticket = self.activate(room_id).await;
        let records = self.api.fetch_history(room_id).await?;
        let messages = canonicalize(retain_room(records, room_id));

        let mut guard = self.state.lock().await;
        if !guard.is_current(ticket) {
            info!(room_id = room_id.0, "reconcile: dropping snapshot for inactive room");
            return Ok(None);
        }
        guard.log = MessageLog::from_snapshot(messages);
        self.publish(&guard.log);
        info!(
            room_id = room_id.0,
            messages = guard.log.len(),
            "reconcile: snapshot installed"
        );
        Ok(Some(guard.log.len()))
    }

    /// Merges raw records into the active room's log.
    pub async fn apply_delta(&self, records: Vec<MessageRecord>) -> MergeOutcome {
        let Some(ticket) = self.ticket().await else {
            debug!("reconcile: delta ignored without an active room");
            return MergeOutcome::default();
        };
        self.apply_delta_for(ticket, records).await
    }

    async fn apply_delta_for(&self, ticket: RoomTicket, records: Vec<MessageRecord>) -> MergeOutcome {
        let messages = canonicalize(retain_room(records, ticket.room_id));
        let mut guard = self.state.lock().await;
        if !guard.is_current(ticket) {
            info!(room_id = ticket.room_id.0, "reconcile: dropping delta for inactive room");
            return MergeOutcome::default();
        }
        let outcome = guard.log.apply_delta(messages);
        if outcome.changed() {
            self.publish(&guard.log);
            debug!(
                room_id = ticket.room_id.0,
                inserted = outcome.inserted,
                promoted = outcome.promoted,
                swept = outcome.swept,
                "reconcile: delta merged"
            );
        }
        outcome
    }

    /// Fetches the active room's history and merges it as a delta. Triggers that
    /// arrive while a refresh is running join it and schedule one more pass.
    pub async fn refresh_delta(self: &Arc<Self>) -> Result<MergeOutcome, ClientError> {
        let ticket = self.ticket().await.ok_or(ClientError::NoActiveRoom)?;
        let flight = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&ticket) {
                Some(existing) => {
                    existing.rerun.store(true, AtomicOrdering::SeqCst);
                    existing.flight.clone()
                }
                None => {
                    let rerun = Arc::new(AtomicBool::new(false));
                    let flight = self.spawn_refresh(ticket, Arc::clone(&rerun));
                    inflight.insert(
                        ticket,
                        InflightRefresh {
                            flight: flight.clone(),
                            rerun,
                        },
                    );
                    flight
                }
            }
        };
        flight.await
    }

    fn spawn_refresh(self: &Arc<Self>, ticket: RoomTicket, rerun: Arc<AtomicBool>) -> SharedRefresh {
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut total = MergeOutcome::default();
            loop {
                match engine.api.fetch_history(ticket.room_id).await {
                    Ok(records) => total.absorb(engine.apply_delta_for(ticket, records).await),
                    Err(err) => {
                        engine.inflight.lock().await.remove(&ticket);
                        warn!(room_id = ticket.room_id.0, "reconcile: delta refresh failed: {err}");
                        return Err(err);
                    }
                }
                let mut inflight = engine.inflight.lock().await;
                if rerun.swap(false, AtomicOrdering::SeqCst) {
                    continue;
                }
                inflight.remove(&ticket);
                return Ok(total);
            }
        });
        async move {
            task.await.unwrap_or_else(|err| {
                Err(ClientError::Transport(format!(
                    "delta refresh task ended unexpectedly: {err}"
                )))
            })
        }
        .boxed()
        .shared()
    }

    /// Fetches a page strictly older than `before` and prepends it.
    pub async fn load_older(&self, before: MessageId, limit: u32) -> Result<usize, ClientError> {
        let ticket = self.ticket().await.ok_or(ClientError::NoActiveRoom)?;
        let records = self.api.fetch_before(ticket.room_id, before, limit).await?;
        let messages = canonicalize(retain_room(records, ticket.room_id));

        let mut guard = self.state.lock().await;
        if !guard.is_current(ticket) {
            info!(
                room_id = ticket.room_id.0,
                "reconcile: dropping older page for inactive room"
            );
            return Ok(0);
        }
        let added = guard.log.merge_older(messages);
        if added > 0 {
            self.publish(&guard.log);
        }
        Ok(added)
    }

    pub async fn append_pending(&self, message: Message) -> bool {
        let mut guard = self.state.lock().await;
        if guard.active_room != Some(message.room_id) {
            return false;
        }
        let appended = guard.log.append_pending(message);
        if appended {
            self.publish(&guard.log);
        }
        appended
    }

    /// No-op when the room is no longer active or the entry was already resolved.
    pub async fn remove_pending(&self, room_id: RoomId, client_key: &ClientKey) -> bool {
        let mut guard = self.state.lock().await;
        if guard.active_room != Some(room_id) {
            return false;
        }
        let removed = guard.log.remove_pending(client_key);
        if removed {
            self.publish(&guard.log);
        }
        removed
    }

    pub async fn sweep_pending(&self, sender_id: UserId) -> usize {
        let mut guard = self.state.lock().await;
        let swept = guard.log.sweep_pending(sender_id);
        if swept > 0 {
            self.publish(&guard.log);
        }
        swept
    }

    fn publish(&self, log: &MessageLog) {
        self.updates.send_replace(log.entries().to_vec());
    }
}

fn retain_room(records: Vec<MessageRecord>, room_id: RoomId) -> Vec<MessageRecord> {
    let total = records.len();
    let retained: Vec<MessageRecord> = records
        .into_iter()
        .filter(|record| record.room_id == room_id)
        .collect();
    if retained.len() != total {
        warn!(
            room_id = room_id.0,
            dropped = total - retained.len(),
            "reconcile: ignoring records addressed to another room"
        );
    }
    retained
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
