//! Actor identity resolution
//!
//! Resolves a `user@domain` handle to a remote actor document via
//! WebFinger discovery, with a TTL cache in front. Resolution results
//! are not permanent: remote servers rotate keys and move inboxes, so
//! entries expire and can be invalidated explicitly.
//!
//! Concurrent resolutions of the same key collapse onto a single
//! in-flight network request: the first caller leads the fetch, later
//! callers await its result over a watch channel. Failures are never
//! cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use url::Url;

use crate::error::FederationError;
use crate::identifier::RemoteCalendarIdentifier;

/// Content type advertised by activity-protocol actor documents
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Resolved identity of a remote calendar actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteActor {
    pub identifier: RemoteCalendarIdentifier,
    pub actor_uri: Url,
    pub inbox_url: Url,
    pub outbox_url: Url,
    /// PEM-encoded public key published by the actor
    pub public_key_pem: String,
    pub supports_activitypub: bool,
    pub resolved_at: DateTime<Utc>,
}

/// Classified resolution failure
///
/// Cloneable so a single in-flight failure can be fanned out to every
/// coalesced caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// DNS, connect, or timeout failure; the caller decides whether to
    /// retry later
    #[error("remote domain unreachable: {0}")]
    Unreachable(String),
    /// The remote answered but does not speak the activity protocol;
    /// terminal, not retried
    #[error("protocol not supported by remote server: {0}")]
    ProtocolUnsupported(String),
    /// Successful HTTP exchange with a body we could not parse
    #[error("profile fetch failed: {0}")]
    ProfileFetchFailed(String),
    /// The remote server reports no such calendar
    #[error("remote calendar not found: {0}")]
    ActorNotFound(String),
}

impl From<ResolveError> for FederationError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unreachable(msg) => FederationError::RemoteUnreachable(msg),
            ResolveError::ProtocolUnsupported(msg) => FederationError::ProtocolUnsupported(msg),
            ResolveError::ProfileFetchFailed(msg) => FederationError::ProfileFetchFailed(msg),
            ResolveError::ActorNotFound(msg) => FederationError::RemoteCalendarNotFound(msg),
        }
    }
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Raw actor document, permissively parsed
///
/// Field presence is validated separately so a missing inbox classifies
/// as "protocol not supported" while a type mismatch classifies as
/// "profile fetch failed".
#[derive(Debug, Clone, Deserialize)]
struct ActorDocument {
    #[serde(default)]
    id: Option<Url>,
    #[serde(default)]
    inbox: Option<Url>,
    #[serde(default)]
    outbox: Option<Url>,
    #[serde(rename = "preferredUsername", default)]
    preferred_username: Option<String>,
    #[serde(rename = "publicKey", default)]
    public_key: Option<PublicKeyDocument>,
}

#[derive(Debug, Clone, Deserialize)]
struct PublicKeyDocument {
    #[serde(rename = "publicKeyPem", default)]
    public_key_pem: Option<String>,
}

/// Network half of identity discovery
///
/// Split out so tests can drive the resolver without a network and so
/// the cache/coalescing logic stays in one place.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// `GET https://{domain}/.well-known/webfinger?resource={resource}`
    async fn fetch_webfinger(
        &self,
        domain: &str,
        resource: &str,
    ) -> Result<WebFingerResponse, ResolveError>;

    /// GET an actor document with the activity content type
    async fn fetch_actor_document(&self, url: &Url) -> Result<serde_json::Value, ResolveError>;
}

/// Injectable time source so tests control cache expiry
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock backed clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// reqwest-backed discovery client
pub struct HttpDiscoveryClient {
    http_client: Arc<reqwest::Client>,
}

impl HttpDiscoveryClient {
    pub fn new(http_client: Arc<reqwest::Client>) -> Self {
        Self { http_client }
    }
}

fn classify_transport(err: &reqwest::Error) -> ResolveError {
    ResolveError::Unreachable(err.to_string())
}

fn classify_status(status: reqwest::StatusCode, what: &str) -> Option<ResolveError> {
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
        return Some(ResolveError::ActorNotFound(format!(
            "{what} returned HTTP {status}"
        )));
    }
    if !status.is_success() {
        return Some(ResolveError::ProtocolUnsupported(format!(
            "{what} returned HTTP {status}"
        )));
    }
    None
}

#[async_trait]
impl DiscoveryClient for HttpDiscoveryClient {
    async fn fetch_webfinger(
        &self,
        domain: &str,
        resource: &str,
    ) -> Result<WebFingerResponse, ResolveError> {
        let endpoint = format!("https://{domain}/.well-known/webfinger");
        let response = self
            .http_client
            .get(&endpoint)
            .query(&[("resource", resource)])
            .header(reqwest::header::ACCEPT, "application/jrd+json")
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        if let Some(err) = classify_status(response.status(), "webfinger") {
            return Err(err);
        }

        response
            .json::<WebFingerResponse>()
            .await
            .map_err(|e| ResolveError::ProfileFetchFailed(format!("invalid webfinger body: {e}")))
    }

    async fn fetch_actor_document(&self, url: &Url) -> Result<serde_json::Value, ResolveError> {
        let response = self
            .http_client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        if let Some(err) = classify_status(response.status(), "actor fetch") {
            return Err(err);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.contains("activity+json") && !content_type.contains("ld+json") {
            return Err(ResolveError::ProtocolUnsupported(format!(
                "actor document served as {content_type:?}"
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ResolveError::ProfileFetchFailed(format!("invalid actor body: {e}")))
    }
}

type SharedResult = Result<RemoteActor, ResolveError>;

/// Cache key: handles for outbound resolution, actor URIs for the
/// inbound verification path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ResolveKey {
    Handle(RemoteCalendarIdentifier),
    Uri(Url),
}

enum CacheSlot {
    Ready {
        actor: RemoteActor,
        fetched_at: Instant,
    },
    Pending(watch::Receiver<Option<SharedResult>>),
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub fresh_entries: usize,
    pub expired_entries: usize,
    pub in_flight: usize,
}

/// Caching, coalescing actor resolver
pub struct ActorResolver {
    discovery: Arc<dyn DiscoveryClient>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: Mutex<HashMap<ResolveKey, CacheSlot>>,
}

impl ActorResolver {
    pub fn new(discovery: Arc<dyn DiscoveryClient>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            discovery,
            clock,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a `user@domain` handle to its actor
    pub async fn resolve(
        &self,
        identifier: &RemoteCalendarIdentifier,
    ) -> Result<RemoteActor, FederationError> {
        self.resolve_slot(ResolveKey::Handle(identifier.clone()))
            .await
            .map_err(Into::into)
    }

    /// Resolve an actor by its profile URI (inbound verification path)
    pub async fn resolve_uri(&self, actor_uri: &Url) -> Result<RemoteActor, FederationError> {
        self.resolve_slot(ResolveKey::Uri(actor_uri.clone()))
            .await
            .map_err(Into::into)
    }

    /// Drop the cached entry for a handle
    pub async fn invalidate(&self, identifier: &RemoteCalendarIdentifier) {
        let mut cache = self.cache.lock().await;
        if let Some(CacheSlot::Ready { actor, .. }) =
            cache.remove(&ResolveKey::Handle(identifier.clone()))
        {
            cache.remove(&ResolveKey::Uri(actor.actor_uri));
        }
        tracing::debug!(identifier = %identifier, "invalidated cached actor");
    }

    /// Drop the cached entry for an actor URI (e.g., delivery says the
    /// actor is gone)
    pub async fn invalidate_uri(&self, actor_uri: &Url) {
        let mut cache = self.cache.lock().await;
        if let Some(CacheSlot::Ready { actor, .. }) =
            cache.remove(&ResolveKey::Uri(actor_uri.clone()))
        {
            cache.remove(&ResolveKey::Handle(actor.identifier));
        }
        tracing::debug!(actor = %actor_uri, "invalidated cached actor");
    }

    /// Cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.lock().await;
        crate::metrics::CACHE_SIZE
            .with_label_values(&["actors"])
            .set(cache.len() as i64);
        let now = self.clock.now();
        let mut stats = CacheStats {
            fresh_entries: 0,
            expired_entries: 0,
            in_flight: 0,
        };
        for slot in cache.values() {
            match slot {
                CacheSlot::Ready { fetched_at, .. } => {
                    if now.duration_since(*fetched_at) < self.ttl {
                        stats.fresh_entries += 1;
                    } else {
                        stats.expired_entries += 1;
                    }
                }
                CacheSlot::Pending(_) => stats.in_flight += 1,
            }
        }
        stats
    }

    /// Drop expired entries; call periodically from the host
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.lock().await;
        let now = self.clock.now();
        let ttl = self.ttl;
        let before = cache.len();
        cache.retain(|_, slot| match slot {
            CacheSlot::Ready { fetched_at, .. } => now.duration_since(*fetched_at) < ttl,
            CacheSlot::Pending(_) => true,
        });
        let removed = before - cache.len();
        if removed > 0 {
            tracing::info!(removed, "pruned expired actor cache entries");
        }
    }

    async fn resolve_slot(&self, key: ResolveKey) -> SharedResult {
        loop {
            enum Role {
                Hit(RemoteActor),
                Wait(watch::Receiver<Option<SharedResult>>),
                Lead(watch::Sender<Option<SharedResult>>),
            }

            let role = {
                let mut cache = self.cache.lock().await;
                let found = match cache.get(&key) {
                    Some(CacheSlot::Ready { actor, fetched_at })
                        if self.clock.now().duration_since(*fetched_at) < self.ttl =>
                    {
                        Some(Role::Hit(actor.clone()))
                    }
                    // A live leader is fetching; a dead one (cancelled
                    // mid-fetch) is replaced below.
                    Some(CacheSlot::Pending(rx))
                        if rx.has_changed().is_ok() || rx.borrow().is_some() =>
                    {
                        Some(Role::Wait(rx.clone()))
                    }
                    _ => None,
                };
                match found {
                    Some(role) => role,
                    None => {
                        let (tx, rx) = watch::channel(None);
                        cache.insert(key.clone(), CacheSlot::Pending(rx));
                        Role::Lead(tx)
                    }
                }
            };

            match role {
                Role::Hit(actor) => {
                    crate::metrics::CACHE_HITS_TOTAL
                        .with_label_values(&["actors"])
                        .inc();
                    return Ok(actor);
                }
                Role::Wait(mut rx) => {
                    loop {
                        let settled = rx.borrow().as_ref().cloned();
                        if let Some(result) = settled {
                            return result;
                        }
                        if rx.changed().await.is_err() {
                            // Leader vanished without settling; retake.
                            break;
                        }
                    }
                }
                Role::Lead(tx) => {
                    crate::metrics::CACHE_MISSES_TOTAL
                        .with_label_values(&["actors"])
                        .inc();
                    let result = self.fetch(&key).await;

                    {
                        let mut cache = self.cache.lock().await;
                        match &result {
                            Ok(actor) => {
                                let fetched_at = self.clock.now();
                                // Prime the companion key so the inbound
                                // path hits the same entry.
                                let companion = match &key {
                                    ResolveKey::Handle(_) => {
                                        Some(ResolveKey::Uri(actor.actor_uri.clone()))
                                    }
                                    ResolveKey::Uri(_) => {
                                        Some(ResolveKey::Handle(actor.identifier.clone()))
                                    }
                                };
                                cache.insert(
                                    key.clone(),
                                    CacheSlot::Ready {
                                        actor: actor.clone(),
                                        fetched_at,
                                    },
                                );
                                if let Some(companion) = companion.filter(|c| *c != key) {
                                    let fetching =
                                        matches!(cache.get(&companion), Some(CacheSlot::Pending(_)));
                                    if !fetching {
                                        cache.insert(
                                            companion,
                                            CacheSlot::Ready {
                                                actor: actor.clone(),
                                                fetched_at,
                                            },
                                        );
                                    }
                                }
                            }
                            Err(_) => {
                                // Failures are not cached.
                                cache.remove(&key);
                            }
                        }
                    }

                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    async fn fetch(&self, key: &ResolveKey) -> SharedResult {
        match key {
            ResolveKey::Handle(identifier) => self.fetch_by_handle(identifier).await,
            ResolveKey::Uri(uri) => self.fetch_by_uri(uri).await,
        }
    }

    async fn fetch_by_handle(&self, identifier: &RemoteCalendarIdentifier) -> SharedResult {
        let webfinger = self
            .discovery
            .fetch_webfinger(identifier.domain(), &identifier.acct_uri())
            .await?;

        let self_link = webfinger
            .links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link
                        .link_type
                        .as_deref()
                        .is_some_and(|t| t.contains("activity+json"))
            })
            .ok_or_else(|| {
                ResolveError::ProtocolUnsupported(format!(
                    "no activity+json self link for {identifier}"
                ))
            })?;

        let href = self_link.href.as_deref().ok_or_else(|| {
            ResolveError::ProtocolUnsupported(format!("self link without href for {identifier}"))
        })?;
        let actor_uri = Url::parse(href).map_err(|e| {
            ResolveError::ProfileFetchFailed(format!("invalid actor URL {href}: {e}"))
        })?;

        let document = self.discovery.fetch_actor_document(&actor_uri).await?;
        let actor = build_actor(document, Some(identifier.clone()), actor_uri)?;
        tracing::info!(identifier = %identifier, inbox = %actor.inbox_url, "resolved remote actor");
        Ok(actor)
    }

    async fn fetch_by_uri(&self, actor_uri: &Url) -> SharedResult {
        let document = self.discovery.fetch_actor_document(actor_uri).await?;
        let actor = build_actor(document, None, actor_uri.clone())?;
        tracing::info!(actor = %actor_uri, "resolved remote actor by URI");
        Ok(actor)
    }
}

/// Validate an actor document and build the cached record
fn build_actor(
    document: serde_json::Value,
    identifier: Option<RemoteCalendarIdentifier>,
    fallback_uri: Url,
) -> SharedResult {
    let document: ActorDocument = serde_json::from_value(document)
        .map_err(|e| ResolveError::ProfileFetchFailed(format!("malformed actor document: {e}")))?;

    let inbox_url = document.inbox.ok_or_else(|| {
        ResolveError::ProtocolUnsupported("actor document missing inbox".to_string())
    })?;
    let outbox_url = document.outbox.ok_or_else(|| {
        ResolveError::ProtocolUnsupported("actor document missing outbox".to_string())
    })?;
    let public_key_pem = document
        .public_key
        .and_then(|key| key.public_key_pem)
        .ok_or_else(|| {
            ResolveError::ProtocolUnsupported("actor document missing public key".to_string())
        })?;

    let actor_uri = document.id.unwrap_or(fallback_uri);

    let identifier = match identifier {
        Some(identifier) => identifier,
        None => derive_identifier(&document.preferred_username, &actor_uri)?,
    };

    Ok(RemoteActor {
        identifier,
        actor_uri,
        inbox_url,
        outbox_url,
        public_key_pem,
        supports_activitypub: true,
        resolved_at: Utc::now(),
    })
}

fn derive_identifier(
    preferred_username: &Option<String>,
    actor_uri: &Url,
) -> Result<RemoteCalendarIdentifier, ResolveError> {
    let username = preferred_username.as_deref().ok_or_else(|| {
        ResolveError::ProtocolUnsupported("actor document missing preferredUsername".to_string())
    })?;
    let host = actor_uri.host_str().ok_or_else(|| {
        ResolveError::ProtocolUnsupported(format!("actor URI {actor_uri} has no host"))
    })?;

    format!("{username}@{host}").parse().map_err(|_| {
        ResolveError::ProtocolUnsupported(format!(
            "cannot derive identifier from {username}@{host}"
        ))
    })
}
