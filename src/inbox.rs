//! Inbound activity dispatch
//!
//! Single entry point for all inbound federation traffic. Requests are
//! verified fail-closed against the sender's published key, parsed into
//! the typed activity model, deduplicated by activity id, and routed to
//! the follow state machine or event-sharing handling.
//!
//! Each inbound item is isolated: one malformed or hostile activity is
//! classified and rejected without affecting anything else in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use url::Url;

use crate::activity::{Activity, ActivityBody, ActivityObject};
use crate::error::{FederationError, Result};
use crate::event::validate_event_uri;
use crate::follow::FollowService;
use crate::policy::{DomainBlockPolicy, EventIngest};
use crate::resolver::{ActorResolver, RemoteActor};
use crate::signing::{InboundEnvelope, SignatureVerifier};

struct SeenSlot {
    lock: Arc<Mutex<bool>>,
    first_seen: Instant,
}

/// Tracks processed activity ids
///
/// Each id owns a small async lock guarding a "done" flag. Holding the
/// lock across handling makes concurrent duplicate deliveries mutually
/// exclusive; the flag is only set after the handler succeeds, so a
/// failed delivery can be retried by the remote while a processed one
/// replays as a no-op.
pub struct SeenRegistry {
    entries: Mutex<HashMap<String, SeenSlot>>,
}

impl SeenRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, activity_id: &str) -> Arc<Mutex<bool>> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(activity_id.to_string())
            .or_insert_with(|| SeenSlot {
                lock: Arc::new(Mutex::new(false)),
                first_seen: Instant::now(),
            })
            .lock
            .clone()
    }

    /// Number of tracked ids
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drop entries older than the retention window; call periodically
    /// from the host
    pub async fn prune_older_than(&self, retention: Duration) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, slot| slot.first_seen.elapsed() < retention);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(removed, "pruned seen-activity entries");
        }
    }
}

impl Default for SeenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes verified inbound activities to their handlers
pub struct InboxDispatcher {
    resolver: Arc<ActorResolver>,
    verifier: Arc<dyn SignatureVerifier>,
    blocks: Arc<dyn DomainBlockPolicy>,
    follows: Arc<FollowService>,
    events: Arc<dyn EventIngest>,
    seen: SeenRegistry,
}

impl InboxDispatcher {
    pub fn new(
        resolver: Arc<ActorResolver>,
        verifier: Arc<dyn SignatureVerifier>,
        blocks: Arc<dyn DomainBlockPolicy>,
        follows: Arc<FollowService>,
        events: Arc<dyn EventIngest>,
    ) -> Self {
        Self {
            resolver,
            verifier,
            blocks,
            follows,
            events,
            seen: SeenRegistry::new(),
        }
    }

    /// Process one inbound federation request
    ///
    /// A replay of an already-processed activity id returns `Ok` without
    /// re-applying side effects; the remote sees a normal ack.
    pub async fn receive(&self, envelope: InboundEnvelope) -> Result<()> {
        // Unsigned requests are rejected before anything is parsed.
        if envelope.signature.is_none() {
            record_outcome("unknown", "rejected");
            return Err(FederationError::InvalidSignature);
        }

        let raw: serde_json::Value = serde_json::from_slice(&envelope.body)
            .map_err(|e| FederationError::Validation(format!("malformed activity body: {e}")))?;

        let type_name = raw
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| FederationError::Validation("missing activity type".to_string()))?
            .to_string();

        if !Activity::is_supported_type(&type_name) {
            record_outcome(&type_name, "rejected");
            return Err(FederationError::NotSupported(type_name));
        }

        let actor_uri = extract_actor_uri(&raw)?;
        let domain = actor_uri
            .host_str()
            .ok_or_else(|| {
                FederationError::Validation(format!("actor URI {actor_uri} has no host"))
            })?
            .to_ascii_lowercase();

        if self.blocks.is_blocked(&domain).await? {
            record_outcome(&type_name, "blocked");
            tracing::info!(actor = %actor_uri, "dropping activity from blocked domain");
            return Err(FederationError::DomainBlocked);
        }

        // The sender's key comes from its actor document, cached in the
        // resolver.
        let actor = self.resolver.resolve_uri(&actor_uri).await?;
        if !self.verifier.verify(&actor, &envelope).await? {
            record_outcome(&type_name, "rejected");
            return Err(FederationError::InvalidSignature);
        }

        let activity: Activity = serde_json::from_value(raw).map_err(|e| {
            FederationError::Validation(format!("malformed {type_name} activity: {e}"))
        })?;

        // The signed actor must be the activity's actor.
        if activity.actor() != &actor.actor_uri {
            record_outcome(&type_name, "rejected");
            return Err(FederationError::InvalidSignature);
        }

        let slot = self.seen.slot(activity.id().as_str()).await;
        let mut done = slot.lock().await;
        if *done {
            record_outcome(&type_name, "duplicate");
            tracing::debug!(activity = %activity.id(), "duplicate delivery acknowledged");
            return Ok(());
        }

        match self.dispatch(&activity, &actor).await {
            Ok(()) => {
                *done = true;
                record_outcome(&type_name, "processed");
                Ok(())
            }
            Err(error) => {
                record_outcome(&type_name, "error");
                tracing::warn!(
                    activity = %activity.id(),
                    kind = error.kind(),
                    "failed to process inbound activity"
                );
                Err(error)
            }
        }
    }

    async fn dispatch(&self, activity: &Activity, actor: &RemoteActor) -> Result<()> {
        match activity {
            Activity::Follow(body) => self.follows.receive_follow(body, actor).await,
            Activity::Accept(_) => self.follows.receive_accept(activity, actor).await,
            Activity::Reject(_) => self.follows.receive_reject(activity, actor).await,
            Activity::Undo(_) => self.follows.receive_undo(activity, actor).await,
            Activity::Create(body) => self.handle_create(body, actor).await,
            Activity::Announce(body) => self.handle_announce(body, actor).await,
        }
    }

    /// A remote actor published an event
    async fn handle_create(&self, body: &ActivityBody, actor: &RemoteActor) -> Result<()> {
        match &body.object {
            ActivityObject::Event(event) => {
                validate_event_uri(&event.id)?;
                self.events.event_created(actor, event.sanitized()).await
            }
            ActivityObject::Reference(uri) => {
                validate_event_uri(uri)?;
                self.events.event_announced(actor, uri.clone()).await
            }
            ActivityObject::Activity(_) => Err(FederationError::Validation(
                "Create object must be an event".to_string(),
            )),
        }
    }

    /// A remote actor reposted an event into its stream
    async fn handle_announce(&self, body: &ActivityBody, actor: &RemoteActor) -> Result<()> {
        match &body.object {
            ActivityObject::Reference(uri) => {
                validate_event_uri(uri)?;
                self.events.event_announced(actor, uri.clone()).await
            }
            ActivityObject::Event(event) => {
                validate_event_uri(&event.id)?;
                self.events.event_created(actor, event.sanitized()).await
            }
            ActivityObject::Activity(_) => Err(FederationError::Validation(
                "Announce object must reference an event".to_string(),
            )),
        }
    }

    /// Retention handle for the host's maintenance loop
    pub fn seen_registry(&self) -> &SeenRegistry {
        &self.seen
    }
}

fn record_outcome(activity_type: &str, outcome: &str) {
    crate::metrics::ACTIVITIES_RECEIVED_TOTAL
        .with_label_values(&[activity_type, outcome])
        .inc();
}

/// Actor field may be a bare URI or an object with an `id`
fn extract_actor_uri(raw: &serde_json::Value) -> Result<Url> {
    let actor = raw
        .get("actor")
        .ok_or_else(|| FederationError::Validation("missing activity actor".to_string()))?;

    let uri = actor
        .as_str()
        .or_else(|| actor.get("id").and_then(|id| id.as_str()))
        .ok_or_else(|| FederationError::Validation("invalid activity actor".to_string()))?;

    Url::parse(uri)
        .map_err(|e| FederationError::Validation(format!("invalid actor URI {uri}: {e}")))
}
