//! Follow relationship lifecycle
//!
//! Governs cross-server follow relationships: initiating a follow of a
//! remote calendar, answering follows received from remote actors
//! (auto-accepted unless the domain is blocked), applying Accept/Reject
//! answers to pending follows, and undoing accepted ones.
//!
//! Receive-side operations are idempotent: the inbox already
//! deduplicates by activity id, and a response for an
//! already-settled relationship is a logged no-op rather than an error
//! or a second transition.

use std::sync::Arc;

use chrono::Utc;
use url::Url;

use crate::activity::{Activity, ActivityBody, builder};
use crate::config::FederationConfig;
use crate::error::{FederationError, Result};
use crate::identifier::RemoteCalendarIdentifier;
use crate::outbox::OutboxDispatcher;
use crate::policy::{DomainBlockPolicy, FederationNotifier, LocalCalendarDirectory};
use crate::resolver::{ActorResolver, RemoteActor};
use crate::store::{
    CalendarId, FollowDirection, FollowRelationship, FollowState, RelationshipStore,
};

fn state_label(state: FollowState) -> &'static str {
    match state {
        FollowState::Pending => "pending",
        FollowState::Accepted => "accepted",
        FollowState::Rejected => "rejected",
        FollowState::Undone => "undone",
    }
}

/// Drives the follow state machine
pub struct FollowService {
    config: Arc<FederationConfig>,
    resolver: Arc<ActorResolver>,
    store: Arc<dyn RelationshipStore>,
    outbox: OutboxDispatcher,
    directory: Arc<dyn LocalCalendarDirectory>,
    blocks: Arc<dyn DomainBlockPolicy>,
    notifier: Arc<dyn FederationNotifier>,
}

impl FollowService {
    pub fn new(
        config: Arc<FederationConfig>,
        resolver: Arc<ActorResolver>,
        store: Arc<dyn RelationshipStore>,
        outbox: OutboxDispatcher,
        directory: Arc<dyn LocalCalendarDirectory>,
        blocks: Arc<dyn DomainBlockPolicy>,
        notifier: Arc<dyn FederationNotifier>,
    ) -> Self {
        Self {
            config,
            resolver,
            store,
            outbox,
            directory,
            blocks,
            notifier,
        }
    }

    /// Follow a remote calendar addressed by `user@domain`
    ///
    /// Resolution failures propagate as-is and leave no relationship
    /// behind. On success a Pending relationship exists and a Follow
    /// activity is queued for the remote inbox.
    pub async fn initiate_follow(
        &self,
        local_calendar: &CalendarId,
        raw_identifier: &str,
    ) -> Result<FollowRelationship> {
        let identifier: RemoteCalendarIdentifier = raw_identifier.parse()?;
        let actor = self.resolver.resolve(&identifier).await?;

        // The resolved actor may turn out to be one of ours, whatever
        // casing or URL form the caller used.
        if let Some(owner) = self.directory.calendar_for_object(&actor.actor_uri).await? {
            if owner == *local_calendar {
                return Err(FederationError::SelfFollow);
            }
        }

        if self
            .store
            .find_active_pair(local_calendar, &actor.actor_uri, FollowDirection::Outgoing)
            .await?
            .is_some()
        {
            return Err(FederationError::DuplicateFollow);
        }

        let local_actor = self.directory.actor_uri(local_calendar).await?;
        let follow_uri = builder::activity_uri(&self.config.instance.base_url(), "follow")?;
        let target = Url::parse(&identifier.acct_uri()).map_err(|e| {
            FederationError::Validation(format!("invalid follow target {identifier}: {e}"))
        })?;
        let activity = builder::follow(follow_uri.clone(), local_actor, target);

        let relationship =
            FollowRelationship::outgoing(local_calendar.clone(), actor.clone(), follow_uri);
        self.store.insert(relationship.clone()).await?;
        self.outbox.enqueue_for_actor(&activity, &actor).await?;

        crate::metrics::RELATIONSHIP_TRANSITIONS_TOTAL
            .with_label_values(&[state_label(FollowState::Pending)])
            .inc();
        self.notifier.relationship_changed(&relationship).await;
        tracing::info!(
            calendar = %local_calendar,
            remote = %identifier,
            follow = %relationship.follow_activity_uri,
            "initiated follow"
        );
        Ok(relationship)
    }

    /// Handle a Follow received from a remote actor
    ///
    /// Follows are auto-accepted; there is no manual approval step. The
    /// block policy is consulted before anything is accepted or stored.
    pub async fn receive_follow(&self, follow: &ActivityBody, actor: &RemoteActor) -> Result<()> {
        let target = follow.object.as_reference().ok_or_else(|| {
            FederationError::Validation("Follow object must be a reference".to_string())
        })?;

        let Some(local_calendar) = self.directory.calendar_for_object(target).await? else {
            return Err(FederationError::Validation(
                "Follow target is not a local calendar".to_string(),
            ));
        };

        if self.blocks.is_blocked(actor.identifier.domain()).await? {
            tracing::info!(
                remote = %actor.identifier,
                calendar = %local_calendar,
                "dropping follow from blocked domain"
            );
            return Err(FederationError::DomainBlocked);
        }

        let relationship = match self
            .store
            .find_active_pair(&local_calendar, &actor.actor_uri, FollowDirection::Incoming)
            .await?
        {
            Some(existing) => {
                // The remote may have missed our Accept; answer again
                // without duplicating the relationship.
                tracing::debug!(
                    relationship = %existing.id,
                    "follow replayed for existing relationship"
                );
                existing
            }
            None => {
                let mut relationship = FollowRelationship::incoming(
                    local_calendar.clone(),
                    actor.clone(),
                    follow.id.clone(),
                );
                relationship.transition(FollowState::Accepted, Utc::now())?;
                self.store.insert(relationship.clone()).await?;

                crate::metrics::RELATIONSHIP_TRANSITIONS_TOTAL
                    .with_label_values(&[state_label(FollowState::Accepted)])
                    .inc();
                self.notifier.relationship_changed(&relationship).await;
                tracing::info!(
                    calendar = %local_calendar,
                    remote = %actor.identifier,
                    "accepted incoming follow"
                );
                relationship
            }
        };

        let local_actor = self.directory.actor_uri(&relationship.local_calendar).await?;
        let accept_uri = builder::activity_uri(&self.config.instance.base_url(), "accept")?;
        let accept = builder::accept(accept_uri, local_actor, Activity::Follow(follow.clone()));
        self.outbox.enqueue_for_actor(&accept, actor).await?;

        Ok(())
    }

    /// Handle an Accept answering one of our pending Follows
    pub async fn receive_accept(&self, accept: &Activity, actor: &RemoteActor) -> Result<()> {
        let follow_uri = accept.follow_reference().ok_or_else(|| {
            FederationError::Validation("Accept does not reference a Follow".to_string())
        })?;
        self.settle_response(follow_uri, actor, FollowState::Accepted)
            .await
    }

    /// Handle a Reject answering one of our pending Follows
    pub async fn receive_reject(&self, reject: &Activity, actor: &RemoteActor) -> Result<()> {
        let follow_uri = reject.follow_reference().ok_or_else(|| {
            FederationError::Validation("Reject does not reference a Follow".to_string())
        })?;
        self.settle_response(follow_uri, actor, FollowState::Rejected)
            .await
    }

    async fn settle_response(
        &self,
        follow_uri: &Url,
        actor: &RemoteActor,
        to: FollowState,
    ) -> Result<()> {
        let Some(relationship) = self.store.find_by_follow_uri(follow_uri).await? else {
            return Err(FederationError::RelationshipNotFound);
        };

        // A spoofed or misdirected response must look exactly like a
        // missing relationship.
        if relationship.direction != FollowDirection::Outgoing
            || relationship.remote_actor.actor_uri != actor.actor_uri
        {
            return Err(FederationError::RelationshipNotFound);
        }

        match relationship.state {
            FollowState::Pending => {
                self.commit_transition(relationship, to).await?;
                Ok(())
            }
            state if state == to => {
                tracing::debug!(follow = %follow_uri, "response replayed, already settled");
                Ok(())
            }
            state => {
                tracing::debug!(
                    follow = %follow_uri,
                    state = state_label(state),
                    "response for settled relationship ignored"
                );
                Ok(())
            }
        }
    }

    /// Handle an Undo of a Follow from a remote follower
    pub async fn receive_undo(&self, undo: &Activity, actor: &RemoteActor) -> Result<()> {
        let follow_uri = undo.follow_reference().ok_or_else(|| {
            FederationError::Validation("Undo does not reference a Follow".to_string())
        })?;

        let Some(relationship) = self.store.find_by_follow_uri(follow_uri).await? else {
            return Err(FederationError::RelationshipNotFound);
        };
        if relationship.direction != FollowDirection::Incoming
            || relationship.remote_actor.actor_uri != actor.actor_uri
        {
            return Err(FederationError::RelationshipNotFound);
        }

        match relationship.state {
            FollowState::Accepted => {
                self.commit_transition(relationship, FollowState::Undone)
                    .await?;
                Ok(())
            }
            FollowState::Undone => {
                tracing::debug!(follow = %follow_uri, "undo replayed, already undone");
                Ok(())
            }
            state => {
                tracing::debug!(
                    follow = %follow_uri,
                    state = state_label(state),
                    "undo for non-accepted relationship ignored"
                );
                Ok(())
            }
        }
    }

    /// Undo a follow this instance initiated; only legal from Accepted
    pub async fn undo_follow(&self, relationship_id: &str) -> Result<FollowRelationship> {
        let Some(relationship) = self.store.get(relationship_id).await? else {
            return Err(FederationError::RelationshipNotFound);
        };

        if relationship.direction != FollowDirection::Outgoing {
            return Err(FederationError::Validation(
                "only outgoing follows can be undone locally".to_string(),
            ));
        }
        if relationship.state != FollowState::Accepted {
            return Err(FederationError::Validation(format!(
                "cannot undo a {} follow",
                state_label(relationship.state)
            )));
        }

        let local_actor = self.directory.actor_uri(&relationship.local_calendar).await?;
        let target = Url::parse(&relationship.remote_actor.identifier.acct_uri()).map_err(|e| {
            FederationError::Validation(format!("invalid follow target for undo: {e}"))
        })?;
        let original = builder::follow(
            relationship.follow_activity_uri.clone(),
            local_actor.clone(),
            target,
        );
        let undo_uri = builder::activity_uri(&self.config.instance.base_url(), "undo")?;
        let undo = builder::undo(undo_uri, local_actor, original);

        let relationship = self
            .commit_transition(relationship, FollowState::Undone)
            .await?;
        self.outbox
            .enqueue_for_actor(&undo, &relationship.remote_actor)
            .await?;

        tracing::info!(
            relationship = %relationship.id,
            remote = %relationship.remote_actor.identifier,
            "undid follow"
        );
        Ok(relationship)
    }

    /// Current relationships for a calendar, for UI display
    pub async fn relationships_for(
        &self,
        local_calendar: &CalendarId,
    ) -> Result<Vec<FollowRelationship>> {
        self.store.list_for_calendar(local_calendar).await
    }

    async fn commit_transition(
        &self,
        mut relationship: FollowRelationship,
        to: FollowState,
    ) -> Result<FollowRelationship> {
        relationship.transition(to, Utc::now())?;
        self.store.update(relationship.clone()).await?;

        crate::metrics::RELATIONSHIP_TRANSITIONS_TOTAL
            .with_label_values(&[state_label(to)])
            .inc();
        self.notifier.relationship_changed(&relationship).await;
        tracing::info!(
            relationship = %relationship.id,
            state = state_label(to),
            "follow relationship transitioned"
        );
        Ok(relationship)
    }
}
