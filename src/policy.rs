//! Collaborator capabilities consumed by the federation engine
//!
//! The surrounding calendar application supplies these: block policy,
//! the local calendar directory, the event store boundary, and the
//! notification sink invoked at state transitions.

use async_trait::async_trait;
use url::Url;

use crate::error::FederationError;
use crate::event::FederatedEvent;
use crate::outbox::DeliveryAttempt;
use crate::resolver::RemoteActor;
use crate::store::{CalendarId, FollowRelationship};

/// Account/domain-level block policy
#[async_trait]
pub trait DomainBlockPolicy: Send + Sync {
    async fn is_blocked(&self, domain: &str) -> Result<bool, FederationError>;
}

/// Maps federation addresses onto local calendars and back
///
/// Implementations must treat actor URLs case-insensitively in host and
/// accept every address form a remote may use for a local calendar
/// (`acct:` URI, actor URL, bare handle).
#[async_trait]
pub trait LocalCalendarDirectory: Send + Sync {
    /// Calendar addressed by a follow target or actor URI, if it is local
    async fn calendar_for_object(&self, object: &Url)
    -> Result<Option<CalendarId>, FederationError>;

    /// Calendar registered under a local WebFinger handle
    async fn calendar_by_handle(&self, handle: &str)
    -> Result<Option<CalendarId>, FederationError>;

    /// Federation actor URI for a local calendar
    async fn actor_uri(&self, calendar: &CalendarId) -> Result<Url, FederationError>;
}

/// Boundary to the authoritative event store
///
/// The engine validates and sanitizes shared objects, then hands them
/// over; what the application persists is its own concern.
#[async_trait]
pub trait EventIngest: Send + Sync {
    /// An inline event shared by a remote actor via Create
    async fn event_created(
        &self,
        actor: &RemoteActor,
        event: FederatedEvent,
    ) -> Result<(), FederationError>;

    /// An event referenced by URI via Announce (repost)
    async fn event_announced(
        &self,
        actor: &RemoteActor,
        event_uri: Url,
    ) -> Result<(), FederationError>;
}

/// Notification sink invoked synchronously at the point of transition
///
/// Replaces fire-and-forget listeners: the engine awaits each call, so
/// observers see transitions in the order they happen.
#[async_trait]
pub trait FederationNotifier: Send + Sync {
    /// A follow relationship was created or changed state
    async fn relationship_changed(&self, relationship: &FollowRelationship);

    /// An activity was delivered to its target inbox
    async fn activity_delivered(&self, attempt: &DeliveryAttempt);

    /// Delivery was abandoned: permanent response or retries exhausted
    async fn delivery_failed(&self, attempt: &DeliveryAttempt, reason: &str);
}

/// Block policy that blocks nothing
pub struct AllowAllDomains;

#[async_trait]
impl DomainBlockPolicy for AllowAllDomains {
    async fn is_blocked(&self, _domain: &str) -> Result<bool, FederationError> {
        Ok(false)
    }
}

/// Notification sink that only logs
pub struct NullNotifier;

#[async_trait]
impl FederationNotifier for NullNotifier {
    async fn relationship_changed(&self, relationship: &FollowRelationship) {
        tracing::debug!(
            relationship = %relationship.id,
            state = ?relationship.state,
            "relationship changed"
        );
    }

    async fn activity_delivered(&self, attempt: &DeliveryAttempt) {
        tracing::debug!(activity = %attempt.activity_id, "activity delivered");
    }

    async fn delivery_failed(&self, attempt: &DeliveryAttempt, reason: &str) {
        tracing::debug!(
            activity = %attempt.activity_id,
            reason,
            "delivery failed"
        );
    }
}
