//! Federation activity model
//!
//! Activities are the signed, typed messages exchanged between servers.
//! The set of types this server understands is closed: a tagged enum with
//! a `type` discriminant keeps wire (de)serialization and validation in
//! one place and makes unsupported types an explicit error rather than a
//! silently ignored message.
//!
//! Activity values are write-once. They are constructed (by the `builder`
//! module or by deserialization) and never mutated; delivery status is
//! tracked separately by the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FederationError;
use crate::event::FederatedEvent;

/// JSON-LD context stamped on outgoing activities
pub const ACTIVITY_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Common envelope fields shared by every activity type
///
/// `id` is a server-assigned URI, globally unique per origin server, and
/// doubles as the idempotency key for inbound deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityBody {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub id: Url,
    pub actor: Url,
    pub object: ActivityObject,
    #[serde(default = "chrono::Utc::now")]
    pub published: DateTime<Utc>,
}

/// A typed federation activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Activity {
    Follow(ActivityBody),
    Accept(ActivityBody),
    Reject(ActivityBody),
    Create(ActivityBody),
    Announce(ActivityBody),
    Undo(ActivityBody),
}

/// The `object` of an activity: a URI reference, an inline federated
/// event, or a nested activity (Accept/Reject/Undo wrap the Follow they
/// answer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActivityObject {
    Reference(Url),
    Activity(Box<Activity>),
    Event(Box<FederatedEvent>),
}

impl ActivityObject {
    pub fn as_reference(&self) -> Option<&Url> {
        match self {
            Self::Reference(uri) => Some(uri),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&FederatedEvent> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_activity(&self) -> Option<&Activity> {
        match self {
            Self::Activity(activity) => Some(activity),
            _ => None,
        }
    }

    /// Id of the Follow this object denotes, whether nested or referenced
    fn follow_id(&self) -> Option<&Url> {
        match self {
            Self::Reference(uri) => Some(uri),
            Self::Activity(activity) => match activity.as_ref() {
                Activity::Follow(body) => Some(&body.id),
                _ => None,
            },
            Self::Event(_) => None,
        }
    }
}

impl Activity {
    /// Wire name of the activity type
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Follow(_) => "Follow",
            Self::Accept(_) => "Accept",
            Self::Reject(_) => "Reject",
            Self::Create(_) => "Create",
            Self::Announce(_) => "Announce",
            Self::Undo(_) => "Undo",
        }
    }

    /// Whether a raw `type` value names an activity this server handles
    pub fn is_supported_type(type_name: &str) -> bool {
        matches!(
            type_name,
            "Follow" | "Accept" | "Reject" | "Create" | "Announce" | "Undo"
        )
    }

    /// Common envelope fields
    pub fn body(&self) -> &ActivityBody {
        match self {
            Self::Follow(body)
            | Self::Accept(body)
            | Self::Reject(body)
            | Self::Create(body)
            | Self::Announce(body)
            | Self::Undo(body) => body,
        }
    }

    pub fn id(&self) -> &Url {
        &self.body().id
    }

    pub fn actor(&self) -> &Url {
        &self.body().actor
    }

    pub fn object(&self) -> &ActivityObject {
        &self.body().object
    }

    pub fn published(&self) -> DateTime<Utc> {
        self.body().published
    }

    /// For Accept/Reject/Undo: the id of the Follow being answered
    pub fn follow_reference(&self) -> Option<&Url> {
        match self {
            Self::Accept(body) | Self::Reject(body) | Self::Undo(body) => body.object.follow_id(),
            _ => None,
        }
    }
}

/// Build outgoing activities
///
/// Ids are server-assigned: `{base_url}/federation/{kind}/{ulid}`.
pub mod builder {
    use super::*;

    fn context() -> Option<serde_json::Value> {
        Some(serde_json::Value::String(ACTIVITY_CONTEXT.to_string()))
    }

    /// Mint a fresh activity URI under the local instance
    pub fn activity_uri(base_url: &str, kind: &str) -> Result<Url, FederationError> {
        let raw = format!(
            "{}/federation/{}/{}",
            base_url.trim_end_matches('/'),
            kind,
            ulid::Ulid::new()
        );
        Url::parse(&raw)
            .map_err(|e| FederationError::Validation(format!("invalid activity URI {raw}: {e}")))
    }

    /// Build a Follow activity
    ///
    /// `object` is the followed calendar, usually as an `acct:` URI.
    pub fn follow(id: Url, actor: Url, object: Url) -> Activity {
        Activity::Follow(ActivityBody {
            context: context(),
            id,
            actor,
            object: ActivityObject::Reference(object),
            published: Utc::now(),
        })
    }

    /// Build an Accept wrapping the Follow being answered
    pub fn accept(id: Url, actor: Url, follow: Activity) -> Activity {
        Activity::Accept(ActivityBody {
            context: context(),
            id,
            actor,
            object: ActivityObject::Activity(Box::new(follow)),
            published: Utc::now(),
        })
    }

    /// Build a Reject wrapping the Follow being answered
    pub fn reject(id: Url, actor: Url, follow: Activity) -> Activity {
        Activity::Reject(ActivityBody {
            context: context(),
            id,
            actor,
            object: ActivityObject::Activity(Box::new(follow)),
            published: Utc::now(),
        })
    }

    /// Build an Undo wrapping a previously sent activity
    pub fn undo(id: Url, actor: Url, undone: Activity) -> Activity {
        Activity::Undo(ActivityBody {
            context: context(),
            id,
            actor,
            object: ActivityObject::Activity(Box::new(undone)),
            published: Utc::now(),
        })
    }

    /// Build a Create carrying an inline federated event
    pub fn create(id: Url, actor: Url, event: FederatedEvent) -> Activity {
        Activity::Create(ActivityBody {
            context: context(),
            id,
            actor,
            object: ActivityObject::Event(Box::new(event)),
            published: Utc::now(),
        })
    }

    /// Build an Announce (repost) referencing a remote event by URI
    pub fn announce(id: Url, actor: Url, event_uri: Url) -> Activity {
        Activity::Announce(ActivityBody {
            context: context(),
            id,
            actor,
            object: ActivityObject::Reference(event_uri),
            published: Utc::now(),
        })
    }
}
