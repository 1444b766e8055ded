//! DID resolution capability.
//!
//! Concrete ledger bindings live outside this crate; the agent only needs
//! [`DidResolver`]. [`StaticResolver`] serves locally created pairwise
//! documents and doubles as the test resolver.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::Duration,
};

use async_trait::async_trait;

use crate::definitions::DidDoc;

#[derive(thiserror::Error, Debug)]
pub enum ResolverError {
    #[error("DID not found: '{0}'")]
    NotFound(String),
    #[error("transient resolution failure for '{0}': {1}")]
    Transient(String, String),
    #[error("internal error")]
    Internal,
}

#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<DidDoc, ResolverError>;
}

/// Policy for retrying resolution with (optionally exponential) backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of retries allowed.
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier for the delay after each retry.
    pub multiplier: f64,
    /// Maximum delay allowed between retries.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    // a freshly published public DID may take a few seconds to appear
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            multiplier: 1.0,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay before the next retry attempt, or `None` when the
    /// budget is exhausted.
    pub fn next_timeout(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries {
            return None;
        }

        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry_count as i32);
        let delay = Duration::from_secs_f64(delay);

        Some(std::cmp::min(delay, self.max_delay))
    }
}

/// Resolve `did`, retrying `NotFound` and transient failures per `policy`.
pub async fn resolve_with_retry(
    resolver: &dyn DidResolver,
    did: &str,
    policy: &RetryPolicy,
) -> Result<DidDoc, ResolverError> {
    let mut attempt = 0;

    loop {
        let err = match resolver.resolve(did).await {
            Ok(doc) => return Ok(doc),
            Err(err) => err,
        };

        match policy.next_timeout(attempt) {
            Some(delay) => {
                tracing::debug!(did, attempt, "resolution failed, retrying: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => return Err(err),
        }
    }
}

/// In-memory resolver for pairwise documents created by this agent and for
/// documents learned from peers.
#[derive(Default)]
pub struct StaticResolver {
    docs: RwLock<HashMap<String, DidDoc>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&self, doc: DidDoc) -> Result<(), ResolverError> {
        self.docs
            .write()
            .map_err(|_| ResolverError::Internal)?
            .insert(doc.id.clone(), doc);

        Ok(())
    }
}

#[async_trait]
impl DidResolver for StaticResolver {
    async fn resolve(&self, did: &str) -> Result<DidDoc, ResolverError> {
        self.docs
            .read()
            .map_err(|_| ResolverError::Internal)?
            .get(did)
            .cloned()
            .ok_or_else(|| ResolverError::NotFound(did.to_string()))
    }
}
