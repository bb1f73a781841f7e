//! HTTP surface
//!
//! - /.well-known/webfinger (identity discovery for local calendars)
//! - /federation/inbox (inbound activities)
//! - /federation/relationships (read access for the host UI)
//! - /metrics (Prometheus exposition)

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use crate::FederationState;
use crate::error::FederationError;
use crate::signing::InboundEnvelope;
use crate::store::{CalendarId, FollowRelationship};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<FederationState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// Create federation router
///
/// Routes:
/// - POST /federation/inbox
/// - GET /federation/relationships
pub fn federation_router() -> Router<FederationState> {
    Router::new()
        .route("/federation/inbox", post(inbox))
        .route("/federation/relationships", get(relationships))
}

/// Create metrics router
pub fn metrics_router() -> Router<FederationState> {
    Router::new().route("/metrics", get(metrics))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local calendars.
///
/// Query: ?resource=acct:calendar@domain
async fn webfinger(
    State(state): State<FederationState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<serde_json::Value>, FederationError> {
    let resource = &query.resource;

    let Some(acct) = resource.strip_prefix("acct:") else {
        return Err(FederationError::Validation(
            "resource must start with 'acct:'".to_string(),
        ));
    };

    let Some((handle, domain)) = acct.split_once('@') else {
        return Err(FederationError::Validation(
            "invalid acct format".to_string(),
        ));
    };

    if !domain.eq_ignore_ascii_case(&state.config.instance.domain) {
        return Err(FederationError::RemoteCalendarNotFound(resource.clone()));
    }

    let Some(calendar) = state.directory.calendar_by_handle(handle).await? else {
        return Err(FederationError::RemoteCalendarNotFound(resource.clone()));
    };

    let actor_url = state.directory.actor_uri(&calendar).await?;

    Ok(Json(serde_json::json!({
        "subject": resource,
        "aliases": [actor_url.clone()],
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": actor_url.clone()
            },
            {
                "rel": "http://webfinger.net/rel/profile-page",
                "type": "text/html",
                "href": actor_url
            }
        ]
    })))
}

/// POST /federation/inbox
///
/// Accepts signed activities from remote servers. Deduplicated replays
/// are acknowledged like first deliveries.
async fn inbox(
    State(state): State<FederationState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, FederationError> {
    let envelope = InboundEnvelope {
        body: body.to_vec(),
        signature: header_value(&headers, "signature"),
        date: header_value(&headers, "date"),
        digest: header_value(&headers, "digest"),
    };

    state.inbox.receive(envelope).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Relationship listing query parameters
#[derive(Debug, Deserialize)]
struct RelationshipsQuery {
    calendar: String,
}

/// GET /federation/relationships?calendar={id}
async fn relationships(
    State(state): State<FederationState>,
    Query(query): Query<RelationshipsQuery>,
) -> Result<Json<Vec<FollowRelationship>>, FederationError> {
    let calendar = CalendarId::new(query.calendar);
    let relationships = state.follows.relationships_for(&calendar).await?;
    Ok(Json(relationships))
}

/// GET /metrics
async fn metrics() -> String {
    crate::metrics::render()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
