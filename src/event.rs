//! Federated event objects
//!
//! The wire representation of a calendar event exchanged between
//! servers. The authoritative event record lives in the surrounding
//! application; this type only carries what federation needs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FederationError;

/// Discriminant carried on the wire (`"type": "Event"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
enum EventKind {
    #[default]
    Event,
}

/// Per-language name and description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContent {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A local event projected into its transportable form
///
/// `content` is keyed by ISO language code; each key is unique and
/// ordering is irrelevant, so a sorted map keeps serialization stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedEvent {
    #[serde(rename = "type", default)]
    kind: EventKind,
    /// Globally unique event URI
    pub id: Url,
    /// When the event takes place
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event: Option<Url>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_events: Vec<Url>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub content: BTreeMap<String, EventContent>,
}

impl FederatedEvent {
    /// Create an event with the required fields; the rest start empty
    pub fn new(id: Url, date: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::Event,
            id,
            date,
            location: String::new(),
            parent_event: None,
            child_events: Vec::new(),
            categories: Vec::new(),
            content: BTreeMap::new(),
        }
    }

    /// Add a translation for the given language code
    pub fn with_content(
        mut self,
        language: impl Into<String>,
        content: EventContent,
    ) -> Self {
        self.content.insert(language.into(), content);
        self
    }

    /// Copy of this event with remote-supplied text run through the
    /// HTML sanitizer
    ///
    /// Remote servers are not trusted to send clean markup.
    pub fn sanitized(&self) -> Self {
        let mut event = self.clone();
        event.location = ammonia::clean(&event.location);
        for content in event.content.values_mut() {
            content.name = ammonia::clean(&content.name);
            content.description = ammonia::clean(&content.description);
        }
        event
    }
}

/// Check that a shared object URL is a plausible event URI
///
/// Announce/Create references must be http(s) URLs with a host;
/// anything else is rejected before the object is handed on.
pub fn validate_event_uri(uri: &Url) -> Result<(), FederationError> {
    match uri.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(FederationError::InvalidSharedEventUrl(format!(
                "unsupported scheme {scheme} in {uri}"
            )));
        }
    }

    if uri.host_str().is_none() {
        return Err(FederationError::InvalidSharedEventUrl(format!(
            "missing host in {uri}"
        )));
    }

    Ok(())
}
