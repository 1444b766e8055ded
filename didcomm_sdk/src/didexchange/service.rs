use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use url::Url;
use uuid::Uuid;

use super::{
    connection::{ConnectionRecord, ConnectionStore, Namespace, State, now_secs},
    events::{
        ActionDecision, ActionEvent, ActionKind, ContinueOpts, EVENT_CHANNEL_CAPACITY, StateMsg,
    },
    machine::{self, Role, StateError, Trigger},
    signature,
};
use crate::{
    definitions::{
        DIDCOMM_SERVICE_TYPE, Destination, DidDoc, DidService, ED25519_VERIFICATION_KEY_TYPE,
        Invitation, VerKey, VerificationMethod,
    },
    dispatch::{InboundContext, OutboundDispatcher, ProtocolService},
    error::Error,
    kms::Kms,
    messages::{Message, Thread, types},
    resolver::{DidResolver, RetryPolicy, resolve_with_retry},
};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Label advertised in invitations and requests.
    pub label: String,
    /// Endpoint peers should deliver to.
    pub service_endpoint: Url,
    /// Continue every action event immediately instead of asking subscribers.
    pub auto_accept: bool,
    /// How long to wait for a subscriber decision before continuing with
    /// defaults (or erroring, in strict mode).
    pub action_grace: Duration,
    /// Error and abandon instead of auto-continuing on action timeout.
    pub strict_actions: bool,
    /// Non-terminal connections older than this are abandoned.
    pub handshake_timeout: Duration,
    pub resolver_retry: RetryPolicy,
}

impl ServiceConfig {
    pub fn new(label: impl Into<String>, service_endpoint: Url) -> Self {
        ServiceConfig {
            label: label.into(),
            service_endpoint,
            auto_accept: true,
            action_grace: Duration::from_secs(10),
            strict_actions: false,
            handshake_timeout: Duration::from_secs(600),
            resolver_retry: RetryPolicy::default(),
        }
    }
}

/// The DID Exchange protocol service: owns the connection state machine,
/// produces and consumes the handshake messages, and publishes state events
/// to subscribers.
pub struct DidExchangeService {
    kms: Arc<Kms>,
    connections: Arc<ConnectionStore>,
    resolver: Arc<dyn DidResolver>,
    dispatcher: Arc<OutboundDispatcher>,
    config: ServiceConfig,
    action_subs: Mutex<Vec<mpsc::Sender<ActionEvent>>>,
    msg_subs: Mutex<Vec<mpsc::Sender<StateMsg>>>,
    // per-connection guards: all transitions for one connection serialize,
    // transitions across connections run in parallel
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    // out-of-order messages waiting for the local transition to catch up
    parked: Mutex<HashMap<String, (Message, InboundContext)>>,
}

impl DidExchangeService {
    pub fn new(
        kms: Arc<Kms>,
        connections: Arc<ConnectionStore>,
        resolver: Arc<dyn DidResolver>,
        dispatcher: Arc<OutboundDispatcher>,
        config: ServiceConfig,
    ) -> Self {
        DidExchangeService {
            kms,
            connections,
            resolver,
            dispatcher,
            config,
            action_subs: Mutex::new(Vec::new()),
            msg_subs: Mutex::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe_action(&self) -> mpsc::Receiver<ActionEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        if let Ok(mut subs) = self.action_subs.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn subscribe_msg(&self) -> mpsc::Receiver<StateMsg> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        if let Ok(mut subs) = self.msg_subs.lock() {
            subs.push(tx);
        }
        rx
    }

    pub async fn connection(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        self.connections.get(connection_id).await
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionRecord>, Error> {
        self.connections.list().await
    }

    /// Create an invitation backed by a fresh key (inviter, `null → invited`).
    pub async fn create_invitation(&self) -> Result<(Invitation, ConnectionRecord), Error> {
        let key = self.kms.create_key()?;

        let invitation = Invitation {
            typ: types::INVITATION.into(),
            id: Uuid::new_v4().to_string(),
            label: self.config.label.clone(),
            recipient_keys: vec![key.clone()],
            service_endpoint: Some(self.config.service_endpoint.clone()),
            routing_keys: Vec::new(),
            did: None,
        };

        self.store_invitation(invitation, key, None, self.config.service_endpoint.clone())
            .await
    }

    /// Create an invitation referencing an existing public DID; its key and
    /// endpoint come from the resolved document and the DID is reused as
    /// `my_did` instead of a fresh pairwise one.
    pub async fn create_invitation_with_did(
        &self,
        did: &str,
    ) -> Result<(Invitation, ConnectionRecord), Error> {
        let doc =
            resolve_with_retry(self.resolver.as_ref(), did, &self.config.resolver_retry).await?;
        let destination =
            Destination::from_did_doc(&doc).map_err(|e| Error::Validation(e.to_string()))?;

        let key = destination.recipient_keys[0].clone();
        if !self.kms.has_key(&key) {
            return Err(Error::Validation(format!(
                "public DID '{did}' advertises a key this agent does not hold"
            )));
        }

        let invitation = Invitation {
            typ: types::INVITATION.into(),
            id: Uuid::new_v4().to_string(),
            label: self.config.label.clone(),
            recipient_keys: Vec::new(),
            service_endpoint: None,
            routing_keys: Vec::new(),
            did: Some(did.to_string()),
        };

        self.store_invitation(
            invitation,
            key,
            Some(did.to_string()),
            destination.service_endpoint,
        )
        .await
    }

    async fn store_invitation(
        &self,
        invitation: Invitation,
        my_key: VerKey,
        my_did: Option<String>,
        my_endpoint: Url,
    ) -> Result<(Invitation, ConnectionRecord), Error> {
        let state = machine::transition(Role::Inviter, State::Null, Trigger::CreateInvitation)?;

        let mut record = ConnectionRecord::new(Namespace::Their, &invitation.id, &invitation.id);
        record.state = state;
        record.my_key = Some(my_key);
        record.my_did = my_did.unwrap_or_default();
        record.my_service_endpoint = Some(my_endpoint);

        self.connections.create(&record).await?;
        self.emit_state(&record, None).await;

        Ok((invitation, record))
    }

    /// Consume an out-of-band invitation (invitee, `null → invited`), then
    /// run the approval step and, if continued, send the request.
    pub async fn receive_invitation(
        &self,
        invitation: Invitation,
    ) -> Result<ConnectionRecord, Error> {
        let (their_key, their_endpoint, routing_keys) = match &invitation.did {
            Some(did) => {
                let doc =
                    resolve_with_retry(self.resolver.as_ref(), did, &self.config.resolver_retry)
                        .await?;
                let destination = Destination::from_did_doc(&doc)
                    .map_err(|e| Error::Validation(e.to_string()))?;
                (
                    destination.recipient_keys[0].clone(),
                    destination.service_endpoint,
                    destination.routing_keys,
                )
            }
            None => {
                let key = invitation.invitation_key().cloned().ok_or_else(|| {
                    Error::Validation("invitation carries no recipient keys".into())
                })?;
                let endpoint = invitation.service_endpoint.clone().ok_or_else(|| {
                    Error::Validation("invitation carries no service endpoint".into())
                })?;
                (key, endpoint, invitation.routing_keys.clone())
            }
        };

        let state = machine::transition(Role::Invitee, State::Null, Trigger::ReceiveInvitation)?;

        let mut record = ConnectionRecord::new(Namespace::My, &invitation.id, &invitation.id);
        record.state = state;
        record.their_key = Some(their_key);
        record.their_service_endpoint = Some(their_endpoint);
        record.routing_keys = routing_keys;
        record.their_label = invitation.label.clone();
        record.their_did = invitation.did.clone().unwrap_or_default();

        self.connections.create(&record).await?;
        self.emit_state(&record, None).await;

        match self
            .maybe_action(ActionKind::InvitationReceived, &record)
            .await?
        {
            Some(opts) => self.accept_invitation(&record.connection_id, opts).await,
            None => self.connections.get(&record.connection_id).await,
        }
    }

    /// Send the connection request (invitee, `invited → requested`).
    pub async fn accept_invitation(
        &self,
        connection_id: &str,
        opts: ContinueOpts,
    ) -> Result<ConnectionRecord, Error> {
        let lock = self.connection_lock(connection_id)?;
        let guard = lock.lock().await;

        let mut record = self.connections.get(connection_id).await?;
        let next = match machine::transition(Role::Invitee, record.state, Trigger::AcceptInvitation)
        {
            Ok(next) => next,
            Err(StateError::Stale(state)) => {
                tracing::debug!(connection_id, %state, "invitation already accepted");
                return Ok(record);
            }
            Err(err) => return Err(err.into()),
        };

        let (my_did, my_doc, my_key) = self.local_identity(&opts).await?;

        let request = types::ConnectionRequest {
            typ: types::REQUEST.into(),
            id: Uuid::new_v4().to_string(),
            label: self.config.label.clone(),
            connection: types::Connection {
                did: my_did.clone(),
                did_doc: Some(my_doc),
            },
            thread: Some(Thread::with_pthid(record.invitation_id.clone())),
        };

        let msg = Message::from_payload(&request)?;
        let destination = record.their_destination()?;
        let queued = self.dispatcher.enqueue(&msg, &my_key, &destination).await?;

        self.connections.reindex_thread(&mut record, &request.id).await?;
        record.my_did = my_did;
        record.my_key = Some(my_key);
        record.my_service_endpoint = Some(self.config.service_endpoint.clone());
        record.state = next;
        self.connections.update(&mut record).await?;
        drop(guard);

        self.emit_state(&record, None).await;
        self.dispatcher.flush(queued).await?;
        self.replay_parked(&record.thread_id).await?;

        Ok(record)
    }

    /// Produce and send the signed response (inviter, `requested → responded`).
    pub async fn accept_request(
        &self,
        connection_id: &str,
        opts: ContinueOpts,
    ) -> Result<ConnectionRecord, Error> {
        let lock = self.connection_lock(connection_id)?;
        let guard = lock.lock().await;

        let mut record = self.connections.get(connection_id).await?;
        let next = match machine::transition(Role::Inviter, record.state, Trigger::AcceptRequest) {
            Ok(next) => next,
            Err(StateError::Stale(state)) => {
                tracing::debug!(connection_id, %state, "request already accepted");
                return Ok(record);
            }
            Err(err) => return Err(err.into()),
        };

        let invitation_key = record.my_key.clone().ok_or_else(|| {
            Error::Validation(format!("connection '{connection_id}' has no invitation key"))
        })?;

        let (my_did, my_doc, my_key) = match record.my_did.is_empty() {
            // a public-DID invitation already fixed our identity
            false if opts.public_did.is_none() => {
                let doc = resolve_with_retry(
                    self.resolver.as_ref(),
                    &record.my_did,
                    &self.config.resolver_retry,
                )
                .await?;
                (record.my_did.clone(), doc, invitation_key.clone())
            }
            _ => self.local_identity(&opts).await?,
        };

        let connection = types::Connection {
            did: my_did.clone(),
            did_doc: Some(my_doc),
        };
        let connection_sig = signature::sign_connection(&self.kms, &connection, &invitation_key)?;

        let response = types::ConnectionResponse {
            typ: types::RESPONSE.into(),
            id: Uuid::new_v4().to_string(),
            thread: Thread {
                thid: Some(record.thread_id.clone()),
                pthid: Some(record.invitation_id.clone()),
                ..Default::default()
            },
            connection_sig,
        };

        let msg = Message::from_payload(&response)?;
        let destination = record.their_destination()?;
        let queued = self
            .dispatcher
            .enqueue(&msg, &invitation_key, &destination)
            .await?;

        record.my_did = my_did;
        record.my_key = Some(my_key);
        record.state = next;
        self.connections.update(&mut record).await?;
        drop(guard);

        self.emit_state(&record, None).await;
        self.dispatcher.flush(queued).await?;
        self.replay_parked(&record.thread_id).await?;

        Ok(record)
    }

    /// Acknowledge the response (invitee, `responded → completed`).
    pub async fn accept_response(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        let lock = self.connection_lock(connection_id)?;
        let guard = lock.lock().await;

        let mut record = self.connections.get(connection_id).await?;
        let next = match machine::transition(Role::Invitee, record.state, Trigger::AcceptResponse) {
            Ok(next) => next,
            Err(StateError::Stale(state)) => {
                tracing::debug!(connection_id, %state, "response already accepted");
                return Ok(record);
            }
            Err(err) => return Err(err.into()),
        };

        let sender = record.my_key.clone().ok_or_else(|| {
            Error::Validation(format!("connection '{connection_id}' has no sender key"))
        })?;

        if record.their_did.is_empty() || record.their_key.is_none() {
            return Err(Error::Validation(format!(
                "connection '{connection_id}' cannot complete without a peer identity"
            )));
        }

        let complete = types::Complete {
            typ: types::COMPLETE.into(),
            id: Uuid::new_v4().to_string(),
            thread: Thread::with_thid(record.thread_id.clone()),
        };

        let msg = Message::from_payload(&complete)?;
        let destination = record.their_destination()?;
        let queued = self.dispatcher.enqueue(&msg, &sender, &destination).await?;

        record.state = next;
        self.connections.update(&mut record).await?;
        drop(guard);

        self.emit_state(&record, None).await;
        self.dispatcher.flush(queued).await?;

        Ok(record)
    }

    /// Abandon every non-terminal connection older than the handshake
    /// timeout. Returns how many were abandoned.
    pub async fn abandon_expired(&self) -> Result<usize, Error> {
        let timeout_secs = self.config.handshake_timeout.as_secs();
        let now = now_secs();
        let mut abandoned = 0;

        for record in self.connections.list().await? {
            if !record.state.is_terminal()
                && now.saturating_sub(record.created_at_secs) > timeout_secs
            {
                self.abandon(&record.connection_id, Trigger::Timeout, "handshake timed out")
                    .await?;
                abandoned += 1;
            }
        }

        Ok(abandoned)
    }

    // ---- inbound message handling ----

    async fn process(&self, msg: Message, ctx: &InboundContext) -> Result<(), Error> {
        match msg.typ() {
            Some(types::REQUEST) => self.process_request(&msg, ctx).await,
            Some(types::RESPONSE) => self.process_response(&msg, ctx).await,
            Some(types::COMPLETE) => self.process_complete(&msg).await,
            Some(types::PROBLEM_REPORT) => self.process_problem_report(&msg).await,
            Some(types::INVITATION) => {
                let invitation: Invitation = msg
                    .to_payload()
                    .map_err(|e| Error::Validation(format!("malformed invitation: {e}")))?;
                self.receive_invitation(invitation).await.map(|_| ())
            }
            Some(other) => Err(Error::UnhandledType(other.to_string())),
            None => Err(Error::Validation("message has no @type".into())),
        }
    }

    async fn process_request(&self, msg: &Message, ctx: &InboundContext) -> Result<(), Error> {
        let request: types::ConnectionRequest = msg
            .to_payload()
            .map_err(|e| Error::Validation(format!("malformed connection request: {e}")))?;

        let Some(pthid) = msg.parent_thread_id() else {
            return Err(Error::Validation(
                "connection request carries no invitation thread".into(),
            ));
        };

        let found = self
            .connections
            .get_by_thread(Namespace::Their, &pthid)
            .await?;
        let lock = self.connection_lock(&found.connection_id)?;
        let guard = lock.lock().await;

        let mut record = self.connections.get(&found.connection_id).await?;
        let next = match machine::transition(Role::Inviter, record.state, Trigger::ReceiveRequest) {
            Ok(next) => next,
            Err(StateError::Stale(state)) => {
                if record.thread_id == request.id {
                    tracing::debug!(thread_id = %request.id, %state, "duplicate connection request ignored");
                    return Ok(());
                }
                drop(guard);
                self.abandon_with_report(
                    &record.connection_id,
                    "conflicting connection request for invitation",
                    "request_not_accepted",
                    Some(request.id.as_str()),
                )
                .await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let their_doc = match request.connection.did_doc.clone() {
            Some(doc) => doc,
            None => {
                resolve_with_retry(
                    self.resolver.as_ref(),
                    &request.connection.did,
                    &self.config.resolver_retry,
                )
                .await?
            }
        };
        let destination =
            Destination::from_did_doc(&their_doc).map_err(|e| Error::Validation(e.to_string()))?;

        // the envelope must come from a key the peer's document advertises
        if !destination.recipient_keys.contains(&ctx.sender_key) {
            drop(guard);
            self.abandon_with_report(
                &record.connection_id,
                "connection request sender key is not in the peer document",
                "request_not_accepted",
                Some(request.id.as_str()),
            )
            .await?;
            return Ok(());
        }

        self.connections.reindex_thread(&mut record, &request.id).await?;
        record.their_did = request.connection.did.clone();
        record.their_key = Some(destination.recipient_keys[0].clone());
        record.their_service_endpoint = Some(destination.service_endpoint);
        record.routing_keys = destination.routing_keys;
        record.their_label = request.label.clone();
        record.state = next;
        self.connections.update(&mut record).await?;
        drop(guard);

        self.emit_state(&record, None).await;

        if let Some(opts) = self.maybe_action(ActionKind::RequestReceived, &record).await? {
            self.accept_request(&record.connection_id, opts).await?;
        }

        Ok(())
    }

    async fn process_response(&self, msg: &Message, ctx: &InboundContext) -> Result<(), Error> {
        let response: types::ConnectionResponse = msg
            .to_payload()
            .map_err(|e| Error::Validation(format!("malformed connection response: {e}")))?;

        let Some(thid) = response.thread.thid.clone() else {
            return Err(Error::Validation("connection response carries no thread".into()));
        };

        let found = match self.connections.get_by_thread(Namespace::My, &thid).await {
            Ok(record) => record,
            Err(Error::ConnectionNotFound(_)) => {
                self.park(&thid, msg, ctx)?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let lock = self.connection_lock(&found.connection_id)?;
        let guard = lock.lock().await;

        let mut record = self.connections.get(&found.connection_id).await?;
        let next = match machine::transition(Role::Invitee, record.state, Trigger::ReceiveResponse)
        {
            Ok(next) => next,
            Err(StateError::Stale(state)) => {
                tracing::debug!(thread_id = %thid, %state, "late connection response ignored");
                return Ok(());
            }
            Err(StateError::Premature(_)) => {
                drop(guard);
                self.park(&thid, msg, ctx)?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let invitation_key = record.their_key.clone().ok_or_else(|| {
            Error::Validation(format!(
                "connection '{}' has no invitation key to verify against",
                record.connection_id
            ))
        })?;

        let connection = match signature::verify_connection(&response.connection_sig, &invitation_key)
        {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(thread_id = %thid, "connection response rejected: {err}");
                drop(guard);
                self.abandon_with_report(
                    &record.connection_id,
                    "connection response signature rejected",
                    "response_not_accepted",
                    Some(thid.as_str()),
                )
                .await?;
                return Ok(());
            }
        };

        let their_doc = match connection.did_doc.clone() {
            Some(doc) => doc,
            None => {
                resolve_with_retry(
                    self.resolver.as_ref(),
                    &connection.did,
                    &self.config.resolver_retry,
                )
                .await?
            }
        };
        let destination =
            Destination::from_did_doc(&their_doc).map_err(|e| Error::Validation(e.to_string()))?;

        record.their_did = connection.did.clone();
        record.their_key = Some(destination.recipient_keys[0].clone());
        record.their_service_endpoint = Some(destination.service_endpoint);
        record.routing_keys = destination.routing_keys;
        record.state = next;
        self.connections.update(&mut record).await?;
        drop(guard);

        self.emit_state(&record, None).await;

        if self
            .maybe_action(ActionKind::ResponseReceived, &record)
            .await?
            .is_some()
        {
            self.accept_response(&record.connection_id).await?;
        }

        Ok(())
    }

    async fn process_complete(&self, msg: &Message) -> Result<(), Error> {
        let Some(thid) = msg.thread().and_then(|t| t.thid) else {
            return Err(Error::Validation("complete carries no thread".into()));
        };

        let found = self.connections.get_by_thread(Namespace::Their, &thid).await?;
        let lock = self.connection_lock(&found.connection_id)?;
        let guard = lock.lock().await;

        let mut record = self.connections.get(&found.connection_id).await?;
        let next = match machine::transition(Role::Inviter, record.state, Trigger::ReceiveComplete)
        {
            Ok(next) => next,
            Err(StateError::Stale(state)) => {
                tracing::debug!(thread_id = %thid, %state, "late complete ignored");
                return Ok(());
            }
            Err(StateError::Premature(_)) => {
                drop(guard);
                let ctx = InboundContext {
                    recipient_key: VerKey::from(""),
                    sender_key: VerKey::from(""),
                    my_did: record.my_did.clone(),
                    their_did: record.their_did.clone(),
                };
                self.park(&thid, msg, &ctx)?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        record.state = next;
        self.connections.update(&mut record).await?;
        drop(guard);

        self.emit_state(&record, None).await;

        Ok(())
    }

    async fn process_problem_report(&self, msg: &Message) -> Result<(), Error> {
        let report: types::ProblemReport = msg
            .to_payload()
            .map_err(|e| Error::Validation(format!("malformed problem report: {e}")))?;

        let Some(thread_id) = msg.thread_id() else {
            return Err(Error::Validation("problem report carries no thread".into()));
        };

        // the report may land on either side of the exchange
        let record = match self.connections.get_by_thread(Namespace::My, &thread_id).await {
            Ok(record) => record,
            Err(Error::ConnectionNotFound(_)) => {
                self.connections
                    .get_by_thread(Namespace::Their, &thread_id)
                    .await?
            }
            Err(err) => return Err(err),
        };

        tracing::warn!(
            connection_id = %record.connection_id,
            code = report.code.as_deref().unwrap_or("unspecified"),
            "peer reported a problem: {}",
            report.description
        );

        self.abandon(
            &record.connection_id,
            Trigger::ReceiveProblemReport,
            &report.description,
        )
        .await
    }

    // ---- internals ----

    fn role_of(record: &ConnectionRecord) -> Role {
        match record.namespace {
            Namespace::Their => Role::Inviter,
            Namespace::My => Role::Invitee,
        }
    }

    async fn abandon(
        &self,
        connection_id: &str,
        trigger: Trigger,
        reason: &str,
    ) -> Result<(), Error> {
        let lock = self.connection_lock(connection_id)?;
        let guard = lock.lock().await;

        let mut record = self.connections.get(connection_id).await?;
        let next = match machine::transition(Self::role_of(&record), record.state, trigger) {
            Ok(next) => next,
            Err(StateError::Stale(_)) | Err(StateError::InvalidTransition { .. }) => {
                tracing::debug!(connection_id, "connection already terminal, not abandoning");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        record.state = next;
        self.connections.update(&mut record).await?;
        drop(guard);

        if let Ok(mut parked) = self.parked.lock() {
            parked.remove(&record.thread_id);
        }

        self.emit_state(&record, Some(reason.to_string())).await;

        Ok(())
    }

    /// Best-effort problem report to the peer, then local abandonment.
    async fn abandon_with_report(
        &self,
        connection_id: &str,
        description: &str,
        code: &str,
        thread_id: Option<&str>,
    ) -> Result<(), Error> {
        let record = self.connections.get(connection_id).await?;

        if let (Ok(destination), Some(sender)) = (record.their_destination(), record.my_key.clone())
        {
            let report = types::ProblemReport {
                typ: types::PROBLEM_REPORT.into(),
                id: Uuid::new_v4().to_string(),
                thread: thread_id.map(Thread::with_thid),
                description: description.to_string(),
                code: Some(code.to_string()),
            };

            match Message::from_payload(&report) {
                Ok(msg) => {
                    if let Err(err) = self.dispatcher.send(&msg, &sender, &destination).await {
                        tracing::warn!(connection_id, "problem report not delivered: {err}");
                    }
                }
                Err(err) => tracing::warn!("problem report not encodable: {err}"),
            }
        }

        self.abandon(connection_id, Trigger::ReceiveProblemReport, description)
            .await
    }

    async fn local_identity(&self, opts: &ContinueOpts) -> Result<(String, DidDoc, VerKey), Error> {
        match &opts.public_did {
            Some(did) => {
                let doc =
                    resolve_with_retry(self.resolver.as_ref(), did, &self.config.resolver_retry)
                        .await?;
                let destination = Destination::from_did_doc(&doc)
                    .map_err(|e| Error::Validation(e.to_string()))?;

                let key = destination.recipient_keys[0].clone();
                if !self.kms.has_key(&key) {
                    return Err(Error::Validation(format!(
                        "public DID '{did}' advertises a key this agent does not hold"
                    )));
                }

                Ok((did.clone(), doc, key))
            }
            None => self.pairwise_identity(),
        }
    }

    /// A fresh pairwise DID: key-derived id, one verification method, one
    /// DIDComm service pointing at our endpoint. The document travels inline
    /// in requests and responses.
    fn pairwise_identity(&self) -> Result<(String, DidDoc, VerKey), Error> {
        let key = self.kms.create_key()?;
        let did = format!("did:peer:{key}");

        let doc = DidDoc {
            id: did.clone(),
            verification_methods: vec![VerificationMethod {
                id: format!("{did}#keys-1"),
                method_type: ED25519_VERIFICATION_KEY_TYPE.into(),
                controller: did.clone(),
                public_key_base58: key.clone(),
            }],
            services: vec![DidService {
                id: format!("{did}#didcomm"),
                service_type: DIDCOMM_SERVICE_TYPE.into(),
                service_endpoint: self.config.service_endpoint.clone(),
                recipient_keys: vec![key.clone()],
                routing_keys: Vec::new(),
            }],
        };

        Ok((did, doc, key))
    }

    fn connection_lock(&self, connection_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, Error> {
        let mut locks = self.locks.lock()?;

        Ok(locks
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    fn park(&self, thread_id: &str, msg: &Message, ctx: &InboundContext) -> Result<(), Error> {
        tracing::debug!(thread_id, "parking out-of-order message");

        self.parked
            .lock()?
            .insert(thread_id.to_string(), (msg.clone(), ctx.clone()));

        Ok(())
    }

    // boxed: replays re-enter `process`
    fn replay_parked<'a>(&'a self, thread_id: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let parked = match self.parked.lock() {
                Ok(mut parked) => parked.remove(thread_id),
                Err(_) => None,
            };

            if let Some((msg, ctx)) = parked {
                tracing::debug!(thread_id, "replaying parked message");
                self.process(msg, &ctx).await?;
            }

            Ok(())
        })
    }

    /// Raise an action event and wait for the decision. `Ok(None)` means the
    /// subscriber stopped the flow (the connection is already abandoned).
    async fn maybe_action(
        &self,
        kind: ActionKind,
        record: &ConnectionRecord,
    ) -> Result<Option<ContinueOpts>, Error> {
        let subscriber = {
            let mut subs = self.action_subs.lock()?;
            subs.retain(|s| !s.is_closed());
            subs.first().cloned()
        };

        let Some(subscriber) = subscriber else {
            return Ok(Some(ContinueOpts::default()));
        };

        if self.config.auto_accept {
            return Ok(Some(ContinueOpts::default()));
        }

        let (responder, decision) = oneshot::channel();
        let event = ActionEvent {
            connection_id: record.connection_id.clone(),
            thread_id: record.thread_id.clone(),
            kind,
            responder,
        };

        if subscriber.send(event).await.is_err() {
            return Ok(Some(ContinueOpts::default()));
        }

        match tokio::time::timeout(self.config.action_grace, decision).await {
            Ok(Ok(ActionDecision::Continue(opts))) => Ok(Some(opts)),
            Ok(Ok(ActionDecision::Stop(reason))) => {
                self.abandon(&record.connection_id, Trigger::ReceiveProblemReport, &reason)
                    .await?;
                Ok(None)
            }
            // subscriber dropped the event without deciding
            Ok(Err(_)) => Ok(Some(ContinueOpts::default())),
            Err(_) if self.config.strict_actions => {
                self.abandon(
                    &record.connection_id,
                    Trigger::Timeout,
                    "action approval timed out",
                )
                .await?;
                Err(Error::Timeout("action approval".into()))
            }
            Err(_) => {
                tracing::debug!(
                    connection_id = %record.connection_id,
                    "action grace elapsed, continuing with defaults"
                );
                Ok(Some(ContinueOpts::default()))
            }
        }
    }

    async fn emit_state(&self, record: &ConnectionRecord, error: Option<String>) {
        let subscribers = match self.msg_subs.lock() {
            Ok(mut subs) => {
                subs.retain(|s| !s.is_closed());
                subs.clone()
            }
            Err(_) => return,
        };

        let event = StateMsg {
            connection_id: record.connection_id.clone(),
            thread_id: record.thread_id.clone(),
            state: record.state,
            error,
        };

        tracing::debug!(
            connection_id = %event.connection_id,
            state = %event.state,
            "connection state changed"
        );

        for subscriber in subscribers {
            if subscriber.send(event.clone()).await.is_err() {
                tracing::trace!("state subscriber went away");
            }
        }
    }
}

#[async_trait]
impl ProtocolService for DidExchangeService {
    fn accepts(&self, msg_type: &str) -> bool {
        types::protocol_of(msg_type) == types::DIDEXCHANGE_PROTOCOL
            || msg_type == types::PROBLEM_REPORT
    }

    async fn handle_inbound(&self, msg: Message, ctx: &InboundContext) -> Result<(), Error> {
        self.process(msg, ctx).await
    }
}
