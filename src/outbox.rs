//! Outbound activity delivery
//!
//! Delivers locally generated activities to remote inboxes. Enqueue
//! returns once the item is queued; delivery happens on a dedicated
//! worker per target inbox, which keeps per-target ordering strict — an
//! Accept queued after its Follow can never overtake it, even across
//! retries.
//!
//! Response classification: 2xx delivered; 4xx other than 429 is a
//! permanent recipient/protocol failure and is not retried; 429, 5xx,
//! and transport errors are transient and retried with exponential
//! backoff until the attempt budget runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::StatusCode;
use tokio::sync::{Mutex, mpsc};
use url::Url;

use crate::activity::Activity;
use crate::config::DeliveryConfig;
use crate::error::FederationError;
use crate::policy::FederationNotifier;
use crate::resolver::{ACTIVITY_JSON, ActorResolver, RemoteActor};
use crate::signing::{RequestSigner, SignatureHeaders};

/// Transport-level delivery failure (always transient)
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// POSTs a signed activity to a remote inbox
#[async_trait]
pub trait ActivityTransport: Send + Sync {
    async fn post_activity(
        &self,
        inbox: &Url,
        body: &[u8],
        headers: &SignatureHeaders,
    ) -> Result<StatusCode, TransportError>;
}

/// reqwest-backed transport
pub struct HttpActivityTransport {
    http_client: Arc<reqwest::Client>,
}

impl HttpActivityTransport {
    pub fn new(http_client: Arc<reqwest::Client>) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl ActivityTransport for HttpActivityTransport {
    async fn post_activity(
        &self,
        inbox: &Url,
        body: &[u8],
        headers: &SignatureHeaders,
    ) -> Result<StatusCode, TransportError> {
        let mut request = self
            .http_client
            .post(inbox.clone())
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::DATE, headers.date.clone())
            .header("Signature", headers.signature.clone());

        if let Some(digest) = &headers.digest {
            request = request.header("Digest", digest.clone());
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(response.status())
    }
}

/// How a delivery response settles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    Delivered,
    Transient,
    Permanent,
}

/// Classify an inbox response status
pub fn classify_response(status: StatusCode) -> DeliveryClass {
    if status.is_success() {
        DeliveryClass::Delivered
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryClass::Transient
    } else {
        DeliveryClass::Permanent
    }
}

/// Exponential backoff schedule for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_seconds),
            max_delay: Duration::from_secs(config.max_delay_seconds),
            max_attempts: config.max_attempts,
            multiplier: config.backoff_multiplier,
        }
    }

    /// Delay before the retry following the given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Whether another attempt fits the budget
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// A queued delivery and its progress
///
/// Ephemeral: lives only as long as the item sits on the outbox queue.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub activity_id: Url,
    pub activity_type: String,
    pub target_inbox: Url,
    /// Actor the inbox belongs to, when known; lets a "gone" response
    /// invalidate the cached actor
    pub target_actor: Option<Url>,
    pub body: Vec<u8>,
    pub attempt_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

enum Settle {
    Delivered,
    Permanent(String),
    Transient(String),
}

struct OutboxInner {
    transport: Arc<dyn ActivityTransport>,
    signer: Arc<dyn RequestSigner>,
    notifier: Arc<dyn FederationNotifier>,
    resolver: Arc<ActorResolver>,
    retry: RetryPolicy,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<DeliveryAttempt>>>,
}

/// Outbox dispatcher with one FIFO delivery lane per target inbox
#[derive(Clone)]
pub struct OutboxDispatcher {
    inner: Arc<OutboxInner>,
}

impl OutboxDispatcher {
    pub fn new(
        transport: Arc<dyn ActivityTransport>,
        signer: Arc<dyn RequestSigner>,
        notifier: Arc<dyn FederationNotifier>,
        resolver: Arc<ActorResolver>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(OutboxInner {
                transport,
                signer,
                notifier,
                resolver,
                retry,
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue an activity for delivery to a remote inbox
    ///
    /// Returns once the activity is queued, not once delivered.
    pub async fn enqueue(
        &self,
        activity: &Activity,
        target_inbox: &Url,
    ) -> Result<(), FederationError> {
        self.enqueue_inner(activity, target_inbox, None).await
    }

    /// Queue an activity for a resolved actor, remembering the actor URI
    /// so permanent "gone" responses can invalidate the cache
    pub async fn enqueue_for_actor(
        &self,
        activity: &Activity,
        actor: &RemoteActor,
    ) -> Result<(), FederationError> {
        self.enqueue_inner(activity, &actor.inbox_url, Some(actor.actor_uri.clone()))
            .await
    }

    async fn enqueue_inner(
        &self,
        activity: &Activity,
        target_inbox: &Url,
        target_actor: Option<Url>,
    ) -> Result<(), FederationError> {
        let body = serde_json::to_vec(activity).map_err(|e| {
            FederationError::Validation(format!("failed to serialize activity: {e}"))
        })?;

        let attempt = DeliveryAttempt {
            activity_id: activity.id().clone(),
            activity_type: activity.type_name().to_string(),
            target_inbox: target_inbox.clone(),
            target_actor,
            body,
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
        };

        let sender = self.lane_sender(target_inbox).await;
        sender
            .send(attempt)
            .map_err(|_| FederationError::Internal(anyhow::anyhow!("delivery lane closed")))?;

        tracing::debug!(
            activity = %activity.id(),
            inbox = %target_inbox,
            "queued activity for delivery"
        );
        Ok(())
    }

    /// Get or start the delivery lane for an inbox
    async fn lane_sender(&self, inbox: &Url) -> mpsc::UnboundedSender<DeliveryAttempt> {
        let mut lanes = self.inner.lanes.lock().await;
        if let Some(sender) = lanes.get(inbox.as_str()) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        lanes.insert(inbox.as_str().to_string(), tx.clone());

        let dispatcher = self.clone();
        let inbox = inbox.clone();
        tokio::spawn(async move {
            dispatcher.run_lane(inbox, rx).await;
        });

        tx
    }

    async fn run_lane(self, inbox: Url, mut rx: mpsc::UnboundedReceiver<DeliveryAttempt>) {
        tracing::debug!(inbox = %inbox, "delivery lane started");
        while let Some(mut attempt) = rx.recv().await {
            self.deliver_until_settled(&mut attempt).await;
        }
        tracing::debug!(inbox = %inbox, "delivery lane stopped");
    }

    /// Drive one queued item to a terminal outcome
    ///
    /// Head-of-line retries are intentional: the next item for this
    /// inbox must not be attempted before this one settles.
    async fn deliver_until_settled(&self, attempt: &mut DeliveryAttempt) {
        loop {
            attempt.attempt_count += 1;

            match self.attempt_once(attempt).await {
                Settle::Delivered => {
                    crate::metrics::DELIVERIES_TOTAL
                        .with_label_values(&["delivered"])
                        .inc();
                    tracing::info!(
                        activity = %attempt.activity_id,
                        inbox = %attempt.target_inbox,
                        attempts = attempt.attempt_count,
                        "delivered activity"
                    );
                    self.inner.notifier.activity_delivered(attempt).await;
                    return;
                }
                Settle::Permanent(reason) => {
                    crate::metrics::DELIVERIES_TOTAL
                        .with_label_values(&["failed"])
                        .inc();
                    tracing::warn!(
                        activity = %attempt.activity_id,
                        inbox = %attempt.target_inbox,
                        reason,
                        "permanent delivery failure"
                    );
                    self.inner.notifier.delivery_failed(attempt, &reason).await;
                    return;
                }
                Settle::Transient(reason) => {
                    attempt.last_error = Some(reason.clone());

                    if !self.inner.retry.should_retry(attempt.attempt_count) {
                        crate::metrics::DELIVERIES_TOTAL
                            .with_label_values(&["failed"])
                            .inc();
                        tracing::warn!(
                            activity = %attempt.activity_id,
                            inbox = %attempt.target_inbox,
                            attempts = attempt.attempt_count,
                            "delivery retries exhausted"
                        );
                        let reason = format!("retries exhausted: {reason}");
                        self.inner.notifier.delivery_failed(attempt, &reason).await;
                        return;
                    }

                    let delay = self
                        .inner
                        .retry
                        .delay_for_attempt(attempt.attempt_count - 1);
                    attempt.next_attempt_at = Some(
                        Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                    crate::metrics::DELIVERIES_TOTAL
                        .with_label_values(&["retried"])
                        .inc();
                    tracing::debug!(
                        activity = %attempt.activity_id,
                        inbox = %attempt.target_inbox,
                        attempt = attempt.attempt_count,
                        delay_secs = delay.as_secs(),
                        reason,
                        "transient delivery failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt_once(&self, attempt: &DeliveryAttempt) -> Settle {
        let headers = match self
            .inner
            .signer
            .sign("POST", &attempt.target_inbox, &attempt.body)
            .await
        {
            Ok(headers) => headers,
            Err(error) => return Settle::Permanent(format!("signing failed: {error}")),
        };

        match self
            .inner
            .transport
            .post_activity(&attempt.target_inbox, &attempt.body, &headers)
            .await
        {
            Ok(status) => match classify_response(status) {
                DeliveryClass::Delivered => Settle::Delivered,
                DeliveryClass::Transient => Settle::Transient(format!("HTTP {status}")),
                DeliveryClass::Permanent => {
                    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                        if let Some(actor_uri) = &attempt.target_actor {
                            self.inner.resolver.invalidate_uri(actor_uri).await;
                        }
                    }
                    Settle::Permanent(format!("HTTP {status}"))
                }
            },
            Err(error) => Settle::Transient(format!("transport error: {error}")),
        }
    }
}
