//! Follow relationship records and their storage seam
//!
//! Durable persistence is supplied by the surrounding application; an
//! in-memory implementation ships here for tests and simple embeddings.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::error::FederationError;
use crate::resolver::RemoteActor;

/// Identifier of a calendar on this instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalendarId(pub String);

impl CalendarId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CalendarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a follow relationship
///
/// `Pending → {Accepted, Rejected}`, `Accepted → Undone`. Rejected and
/// Undone are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowState {
    Pending,
    Accepted,
    Rejected,
    Undone,
}

impl FollowState {
    /// Terminal states admit no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Undone)
    }
}

/// Which side initiated the follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowDirection {
    /// A local calendar follows a remote one
    Outgoing,
    /// A remote actor follows a local calendar
    Incoming,
}

/// A directed subscription between a local calendar and a remote actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowRelationship {
    pub id: String,
    pub local_calendar: CalendarId,
    pub remote_actor: RemoteActor,
    pub direction: FollowDirection,
    pub state: FollowState,
    /// Id of the Follow activity that opened this relationship; Accepts
    /// and Rejects are matched against it
    pub follow_activity_uri: Url,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl FollowRelationship {
    /// New pending relationship for a follow this instance initiated
    pub fn outgoing(
        local_calendar: CalendarId,
        remote_actor: RemoteActor,
        follow_activity_uri: Url,
    ) -> Self {
        Self::new(
            local_calendar,
            remote_actor,
            FollowDirection::Outgoing,
            follow_activity_uri,
        )
    }

    /// New pending relationship for a follow received from a remote actor
    pub fn incoming(
        local_calendar: CalendarId,
        remote_actor: RemoteActor,
        follow_activity_uri: Url,
    ) -> Self {
        Self::new(
            local_calendar,
            remote_actor,
            FollowDirection::Incoming,
            follow_activity_uri,
        )
    }

    fn new(
        local_calendar: CalendarId,
        remote_actor: RemoteActor,
        direction: FollowDirection,
        follow_activity_uri: Url,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            local_calendar,
            remote_actor,
            direction,
            state: FollowState::Pending,
            follow_activity_uri,
            created_at: Utc::now(),
            responded_at: None,
        }
    }

    /// Apply a state transition, enforcing the machine
    ///
    /// The relationship transitions out of Pending exactly once; the only
    /// move afterwards is Accepted → Undone.
    pub fn transition(
        &mut self,
        to: FollowState,
        at: DateTime<Utc>,
    ) -> Result<(), FederationError> {
        use FollowState::{Accepted, Pending, Rejected, Undone};

        let legal = matches!(
            (self.state, to),
            (Pending, Accepted) | (Pending, Rejected) | (Accepted, Undone)
        );
        if !legal {
            return Err(FederationError::Validation(format!(
                "illegal follow transition {:?} -> {:?}",
                self.state, to
            )));
        }

        self.state = to;
        self.responded_at = Some(at);
        Ok(())
    }
}

/// Durable storage for follow relationships
///
/// Implementations must reject a second non-terminal relationship for
/// the same (calendar, actor, direction) triple.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    async fn insert(&self, relationship: FollowRelationship) -> Result<(), FederationError>;

    async fn update(&self, relationship: FollowRelationship) -> Result<(), FederationError>;

    async fn get(&self, id: &str) -> Result<Option<FollowRelationship>, FederationError>;

    /// Non-terminal relationship for the triple, if one exists
    async fn find_active_pair(
        &self,
        local_calendar: &CalendarId,
        remote_actor_uri: &Url,
        direction: FollowDirection,
    ) -> Result<Option<FollowRelationship>, FederationError>;

    /// Relationship opened by the given Follow activity id
    async fn find_by_follow_uri(
        &self,
        follow_activity_uri: &Url,
    ) -> Result<Option<FollowRelationship>, FederationError>;

    async fn list_for_calendar(
        &self,
        local_calendar: &CalendarId,
    ) -> Result<Vec<FollowRelationship>, FederationError>;
}

/// In-memory relationship store
pub struct MemoryRelationshipStore {
    relationships: RwLock<HashMap<String, FollowRelationship>>,
}

impl MemoryRelationshipStore {
    pub fn new() -> Self {
        Self {
            relationships: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRelationshipStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationshipStore for MemoryRelationshipStore {
    async fn insert(&self, relationship: FollowRelationship) -> Result<(), FederationError> {
        let mut relationships = self.relationships.write().await;

        let duplicate = relationships.values().any(|existing| {
            existing.local_calendar == relationship.local_calendar
                && existing.remote_actor.actor_uri == relationship.remote_actor.actor_uri
                && existing.direction == relationship.direction
                && !existing.state.is_terminal()
        });
        if duplicate {
            return Err(FederationError::DuplicateFollow);
        }

        if relationships.contains_key(&relationship.id) {
            return Err(FederationError::DuplicateFollow);
        }

        relationships.insert(relationship.id.clone(), relationship);
        Ok(())
    }

    async fn update(&self, relationship: FollowRelationship) -> Result<(), FederationError> {
        let mut relationships = self.relationships.write().await;
        if !relationships.contains_key(&relationship.id) {
            return Err(FederationError::RelationshipNotFound);
        }
        relationships.insert(relationship.id.clone(), relationship);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<FollowRelationship>, FederationError> {
        let relationships = self.relationships.read().await;
        Ok(relationships.get(id).cloned())
    }

    async fn find_active_pair(
        &self,
        local_calendar: &CalendarId,
        remote_actor_uri: &Url,
        direction: FollowDirection,
    ) -> Result<Option<FollowRelationship>, FederationError> {
        let relationships = self.relationships.read().await;
        Ok(relationships
            .values()
            .find(|rel| {
                rel.local_calendar == *local_calendar
                    && rel.remote_actor.actor_uri == *remote_actor_uri
                    && rel.direction == direction
                    && !rel.state.is_terminal()
            })
            .cloned())
    }

    async fn find_by_follow_uri(
        &self,
        follow_activity_uri: &Url,
    ) -> Result<Option<FollowRelationship>, FederationError> {
        let relationships = self.relationships.read().await;
        Ok(relationships
            .values()
            .find(|rel| rel.follow_activity_uri == *follow_activity_uri)
            .cloned())
    }

    async fn list_for_calendar(
        &self,
        local_calendar: &CalendarId,
    ) -> Result<Vec<FollowRelationship>, FederationError> {
        let relationships = self.relationships.read().await;
        let mut matching: Vec<_> = relationships
            .values()
            .filter(|rel| rel.local_calendar == *local_calendar)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }
}
