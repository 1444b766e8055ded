use std::{
    fmt::{self, Display},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::{
    definitions::{Destination, VerKey},
    dispatch::{ConnectionLookup, KeyDidMapper},
    error::Error,
    storage::{StorageProvider, Store},
};

pub const CONNECTION_STORE: &str = "didexchange_connections";

/// DID Exchange connection state. Transitions are strictly forward
/// (`null < invited < requested < responded < completed`); any non-terminal
/// state may drop to `abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Null,
    Invited,
    Requested,
    Responded,
    Completed,
    Abandoned,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Abandoned)
    }

    /// Position in the forward order; used to enforce monotonicity.
    pub fn rank(&self) -> u8 {
        match self {
            State::Null => 0,
            State::Invited => 1,
            State::Requested => 2,
            State::Responded => 3,
            State::Completed => 4,
            State::Abandoned => 5,
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            State::Null => "null",
            State::Invited => "invited",
            State::Requested => "requested",
            State::Responded => "responded",
            State::Completed => "completed",
            State::Abandoned => "abandoned",
        };
        f.write_str(label)
    }
}

/// Whose perspective owns a thread-keyed record; keeps an inviter and an
/// invitee coexisting on the same node from aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    My,
    Their,
}

impl Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Namespace::My => "my",
            Namespace::Their => "their",
        })
    }
}

/// The canonical per-peer connection state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: String,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<String>,
    pub namespace: Namespace,
    pub state: State,
    pub invitation_id: String,
    #[serde(default)]
    pub my_did: String,
    #[serde(default)]
    pub their_did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_key: Option<VerKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_key: Option<VerKey>,
    #[serde(default)]
    pub their_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_service_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_service_endpoint: Option<Url>,
    #[serde(default)]
    pub routing_keys: Vec<VerKey>,
    pub created_at_secs: u64,
    pub updated_at_secs: u64,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl ConnectionRecord {
    pub fn new(namespace: Namespace, thread_id: &str, invitation_id: &str) -> Self {
        let now = now_secs();

        ConnectionRecord {
            connection_id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            parent_thread_id: None,
            namespace,
            state: State::Null,
            invitation_id: invitation_id.to_string(),
            my_did: String::new(),
            their_did: String::new(),
            my_key: None,
            their_key: None,
            their_label: String::new(),
            my_service_endpoint: None,
            their_service_endpoint: None,
            routing_keys: Vec::new(),
            created_at_secs: now,
            updated_at_secs: now,
        }
    }

    /// The destination for messages to the peer, once its keys are known.
    pub fn their_destination(&self) -> Result<Destination, Error> {
        let (Some(endpoint), Some(key)) = (&self.their_service_endpoint, &self.their_key) else {
            return Err(Error::Validation(format!(
                "connection '{}' has no peer destination yet",
                self.connection_id
            )));
        };

        Ok(Destination {
            service_endpoint: endpoint.clone(),
            recipient_keys: vec![key.clone()],
            routing_keys: self.routing_keys.clone(),
        })
    }
}

fn record_key(connection_id: &str) -> String {
    format!("conn_{connection_id}")
}

fn thread_key(namespace: Namespace, thread_id: &str) -> String {
    format!("thread_{namespace}|{thread_id}")
}

/// Persists connection records indexed by connection id and by
/// `(namespace, thread_id)`.
pub struct ConnectionStore {
    store: Arc<dyn Store>,
}

impl ConnectionStore {
    pub async fn open(storage: &dyn StorageProvider) -> Result<Self, Error> {
        Ok(ConnectionStore {
            store: storage.open_store(CONNECTION_STORE).await?,
        })
    }

    /// Persist a new record. The `(namespace, thread_id)` pair must be free.
    pub async fn create(&self, record: &ConnectionRecord) -> Result<(), Error> {
        let index = thread_key(record.namespace, &record.thread_id);

        if self.store.get(&index).await.is_ok() {
            return Err(Error::Validation(format!(
                "thread '{}' already has a {} connection",
                record.thread_id, record.namespace
            )));
        }

        self.store
            .put(&index, record.connection_id.as_bytes())
            .await?;
        self.write_record(record).await
    }

    /// Persist an update to an existing record, enforcing forward-only state
    /// movement and immutability of the peer identity after completion.
    pub async fn update(&self, record: &mut ConnectionRecord) -> Result<(), Error> {
        let existing = self.get(&record.connection_id).await?;

        if record.state.rank() < existing.state.rank() {
            return Err(Error::Validation(format!(
                "connection '{}' may not move back from {} to {}",
                record.connection_id, existing.state, record.state
            )));
        }

        if existing.state == State::Completed
            && (record.their_did != existing.their_did
                || record.their_key != existing.their_key
                || record.their_service_endpoint != existing.their_service_endpoint)
        {
            return Err(Error::Validation(format!(
                "connection '{}' is completed; peer identity is immutable",
                record.connection_id
            )));
        }

        record.updated_at_secs = now_secs();

        self.write_record(record).await
    }

    /// Move the record to a new protocol thread (invitation id → request id).
    /// The old thread key stays behind as an alias, so late messages
    /// correlated by the invitation still find the connection.
    pub async fn reindex_thread(
        &self,
        record: &mut ConnectionRecord,
        new_thread_id: &str,
    ) -> Result<(), Error> {
        let index = thread_key(record.namespace, new_thread_id);

        if self.store.get(&index).await.is_ok() {
            return Err(Error::Validation(format!(
                "thread '{new_thread_id}' already has a {} connection",
                record.namespace
            )));
        }

        self.store
            .put(&index, record.connection_id.as_bytes())
            .await?;

        record.parent_thread_id = Some(record.thread_id.clone());
        record.thread_id = new_thread_id.to_string();

        self.write_record(record).await
    }

    pub async fn get(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        match self.store.get(&record_key(connection_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.is_not_found() => {
                Err(Error::ConnectionNotFound(connection_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_thread(
        &self,
        namespace: Namespace,
        thread_id: &str,
    ) -> Result<ConnectionRecord, Error> {
        match self.store.get(&thread_key(namespace, thread_id)).await {
            Ok(bytes) => {
                let connection_id = String::from_utf8(bytes)
                    .map_err(|_| Error::Validation("corrupt thread index".into()))?;
                self.get(&connection_id).await
            }
            Err(err) if err.is_not_found() => Err(Error::ConnectionNotFound(format!(
                "{namespace}|{thread_id}"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list(&self) -> Result<Vec<ConnectionRecord>, Error> {
        Ok(self
            .store
            .scan_prefix("conn_")
            .await?
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect())
    }

    pub async fn find_by_my_key(&self, key: &VerKey) -> Result<Option<ConnectionRecord>, Error> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.my_key.as_ref() == Some(key)))
    }

    pub async fn find_by_did_pair(
        &self,
        my_did: &str,
        their_did: &str,
    ) -> Result<Option<ConnectionRecord>, Error> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.my_did == my_did && r.their_did == their_did))
    }

    async fn write_record(&self, record: &ConnectionRecord) -> Result<(), Error> {
        let bytes = serde_json::to_vec(record)?;

        self.store
            .put(&record_key(&record.connection_id), &bytes)
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl ConnectionLookup for ConnectionStore {
    async fn sender_and_destination(
        &self,
        my_did: &str,
        their_did: &str,
    ) -> Result<(VerKey, Destination), Error> {
        let record = self
            .find_by_did_pair(my_did, their_did)
            .await?
            .ok_or_else(|| Error::ConnectionNotFound(format!("{my_did} -> {their_did}")))?;

        let sender = record.my_key.clone().ok_or_else(|| {
            Error::Validation(format!(
                "connection '{}' has no sender key",
                record.connection_id
            ))
        })?;

        Ok((sender, record.their_destination()?))
    }
}

#[async_trait]
impl KeyDidMapper for ConnectionStore {
    async fn dids_for_keys(&self, recipient: &VerKey, _sender: &VerKey) -> (String, String) {
        match self.find_by_my_key(recipient).await {
            Ok(Some(record)) => (record.my_did, record.their_did),
            _ => (String::new(), String::new()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryStorageProvider;

    async fn store() -> ConnectionStore {
        ConnectionStore::open(&MemoryStorageProvider::new())
            .await
            .unwrap()
    }

    fn record(namespace: Namespace, thread_id: &str) -> ConnectionRecord {
        let mut record = ConnectionRecord::new(namespace, thread_id, "inv-1");
        record.state = State::Invited;
        record
    }

    #[tokio::test]
    async fn thread_pair_is_unique() {
        let store = store().await;

        store.create(&record(Namespace::My, "t-1")).await.unwrap();

        // same thread, same namespace: rejected
        assert!(store.create(&record(Namespace::My, "t-1")).await.is_err());

        // same thread, other namespace: allowed
        store.create(&record(Namespace::Their, "t-1")).await.unwrap();
    }

    #[tokio::test]
    async fn lookup_by_thread_and_id() {
        let store = store().await;
        let created = record(Namespace::Their, "t-2");
        store.create(&created).await.unwrap();

        let by_thread = store.get_by_thread(Namespace::Their, "t-2").await.unwrap();
        assert_eq!(by_thread.connection_id, created.connection_id);

        assert!(matches!(
            store.get_by_thread(Namespace::My, "t-2").await,
            Err(Error::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn state_is_monotonic() {
        let store = store().await;
        let mut created = record(Namespace::My, "t-3");
        store.create(&created).await.unwrap();

        created.state = State::Requested;
        store.update(&mut created).await.unwrap();

        created.state = State::Invited;
        assert!(store.update(&mut created).await.is_err());
    }

    #[tokio::test]
    async fn completed_peer_identity_is_immutable() {
        let store = store().await;
        let mut created = record(Namespace::My, "t-4");
        created.their_did = "did:peer:them".into();
        store.create(&created).await.unwrap();

        created.state = State::Completed;
        store.update(&mut created).await.unwrap();

        created.their_did = "did:peer:somebody-else".into();
        assert!(store.update(&mut created).await.is_err());
    }

    #[tokio::test]
    async fn reindex_keeps_invitation_alias() {
        let store = store().await;
        let mut created = record(Namespace::Their, "inv-1");
        store.create(&created).await.unwrap();

        store.reindex_thread(&mut created, "req-1").await.unwrap();
        assert_eq!(created.thread_id, "req-1");
        assert_eq!(created.parent_thread_id.as_deref(), Some("inv-1"));

        // both the new thread id and the invitation id resolve
        let by_request = store.get_by_thread(Namespace::Their, "req-1").await.unwrap();
        let by_invitation = store.get_by_thread(Namespace::Their, "inv-1").await.unwrap();
        assert_eq!(by_request.connection_id, by_invitation.connection_id);
    }
}
