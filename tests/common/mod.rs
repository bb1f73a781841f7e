//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use url::Url;

use almanac::activity::Activity;
use almanac::config::{DeliveryConfig, FederationConfig, InstanceConfig, ResolverConfig};
use almanac::error::FederationError;
use almanac::event::FederatedEvent;
use almanac::outbox::{ActivityTransport, DeliveryAttempt, TransportError};
use almanac::policy::{DomainBlockPolicy, EventIngest, FederationNotifier, LocalCalendarDirectory};
use almanac::resolver::{Clock, DiscoveryClient, RemoteActor, ResolveError, WebFingerLink, WebFingerResponse};
use almanac::signing::{InboundEnvelope, RequestSigner, SignatureHeaders, SignatureVerifier};
use almanac::store::{CalendarId, FollowRelationship, MemoryRelationshipStore};
use almanac::{Collaborators, FederationState};

pub const LOCAL_DOMAIN: &str = "local.example";
pub const LOCAL_BASE_URL: &str = "https://local.example";

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .try_init();
}

/// Poll until the condition holds; panics after ~2s of (virtual) time
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

// =============================================================================
// Discovery fake
// =============================================================================

/// Serves deterministic actors for any `user@domain` handle:
/// actor `https://{domain}/calendars/{user}`, inbox `.../inbox`.
pub struct FakeDiscovery {
    pub webfinger_calls: AtomicUsize,
    pub actor_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    domain_failures: Mutex<HashMap<String, ResolveError>>,
}

impl FakeDiscovery {
    pub fn new() -> Self {
        Self {
            webfinger_calls: AtomicUsize::new(0),
            actor_calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
            domain_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Every lookup against this domain fails with the given error
    pub fn fail_domain(&self, domain: &str, error: ResolveError) {
        self.domain_failures
            .lock()
            .unwrap()
            .insert(domain.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.domain_failures.lock().unwrap().clear();
    }
}

pub fn fake_actor_document(username: &str, domain: &str) -> serde_json::Value {
    serde_json::json!({
        "id": format!("https://{domain}/calendars/{username}"),
        "type": "Group",
        "preferredUsername": username,
        "inbox": format!("https://{domain}/calendars/{username}/inbox"),
        "outbox": format!("https://{domain}/calendars/{username}/outbox"),
        "publicKey": {
            "id": format!("https://{domain}/calendars/{username}#main-key"),
            "publicKeyPem": "-----BEGIN PUBLIC KEY-----\ntest\n-----END PUBLIC KEY-----"
        }
    })
}

#[async_trait]
impl DiscoveryClient for FakeDiscovery {
    async fn fetch_webfinger(
        &self,
        domain: &str,
        resource: &str,
    ) -> Result<WebFingerResponse, ResolveError> {
        self.webfinger_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.domain_failures.lock().unwrap().get(domain) {
            return Err(error.clone());
        }

        let username = resource
            .trim_start_matches("acct:")
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(WebFingerResponse {
            subject: resource.to_string(),
            aliases: None,
            links: vec![WebFingerLink {
                rel: "self".to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(format!("https://{domain}/calendars/{username}")),
            }],
        })
    }

    async fn fetch_actor_document(&self, url: &Url) -> Result<serde_json::Value, ResolveError> {
        self.actor_calls.fetch_add(1, Ordering::SeqCst);
        let domain = url.host_str().unwrap_or_default().to_string();
        if let Some(error) = self.domain_failures.lock().unwrap().get(&domain) {
            return Err(error.clone());
        }

        let username = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
            .unwrap_or_default()
            .to_string();
        Ok(fake_actor_document(&username, &domain))
    }
}

/// Resolve a remote actor the way the fakes will serve it
pub fn fake_remote_actor(username: &str, domain: &str) -> RemoteActor {
    RemoteActor {
        identifier: format!("{username}@{domain}").parse().unwrap(),
        actor_uri: Url::parse(&format!("https://{domain}/calendars/{username}")).unwrap(),
        inbox_url: Url::parse(&format!("https://{domain}/calendars/{username}/inbox")).unwrap(),
        outbox_url: Url::parse(&format!("https://{domain}/calendars/{username}/outbox")).unwrap(),
        public_key_pem: "-----BEGIN PUBLIC KEY-----\ntest\n-----END PUBLIC KEY-----".to_string(),
        supports_activitypub: true,
        resolved_at: chrono::Utc::now(),
    }
}

// =============================================================================
// Transport fake
// =============================================================================

#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub inbox: String,
    pub body: serde_json::Value,
    pub at: tokio::time::Instant,
}

/// Records outbound deliveries and plays back scripted responses.
///
/// Scripted status `0` simulates a transport error; inboxes without a
/// script always answer 202.
pub struct FakeTransport {
    records: Mutex<Vec<DeliveryRecord>>,
    scripts: Mutex<HashMap<String, VecDeque<u16>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, inbox: &str, statuses: &[u16]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(inbox.to_string(), statuses.iter().copied().collect());
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn deliveries_to(&self, inbox: &str) -> Vec<DeliveryRecord> {
        self.deliveries()
            .into_iter()
            .filter(|record| record.inbox == inbox)
            .collect()
    }

    pub fn delivered_types(&self, inbox: &str) -> Vec<String> {
        self.deliveries_to(inbox)
            .iter()
            .map(|record| {
                record.body["type"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    pub fn delivery_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl ActivityTransport for FakeTransport {
    async fn post_activity(
        &self,
        inbox: &Url,
        body: &[u8],
        _headers: &SignatureHeaders,
    ) -> Result<http::StatusCode, TransportError> {
        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
        self.records.lock().unwrap().push(DeliveryRecord {
            inbox: inbox.to_string(),
            body: parsed,
            at: tokio::time::Instant::now(),
        });

        let status = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(inbox.as_str())
            .and_then(|queue| queue.pop_front())
            .unwrap_or(202);

        if status == 0 {
            return Err(TransportError("connection reset by peer".to_string()));
        }
        Ok(http::StatusCode::from_u16(status).expect("scripted status code"))
    }
}

// =============================================================================
// Signing fakes
// =============================================================================

pub struct NoopSigner;

#[async_trait]
impl RequestSigner for NoopSigner {
    async fn sign(
        &self,
        _method: &str,
        _target: &Url,
        _body: &[u8],
    ) -> Result<SignatureHeaders, FederationError> {
        Ok(SignatureHeaders {
            date: "Thu, 01 Jan 2026 00:00:00 GMT".to_string(),
            digest: Some("SHA-256=test".to_string()),
            signature: "keyId=\"test\",signature=\"test\"".to_string(),
        })
    }
}

/// Verifier that accepts every signed request
pub struct AcceptAllVerifier;

#[async_trait]
impl SignatureVerifier for AcceptAllVerifier {
    async fn verify(
        &self,
        _actor: &RemoteActor,
        _envelope: &InboundEnvelope,
    ) -> Result<bool, FederationError> {
        Ok(true)
    }
}

/// Verifier that rejects everything
pub struct DenyAllVerifier;

#[async_trait]
impl SignatureVerifier for DenyAllVerifier {
    async fn verify(
        &self,
        _actor: &RemoteActor,
        _envelope: &InboundEnvelope,
    ) -> Result<bool, FederationError> {
        Ok(false)
    }
}

// =============================================================================
// Directory, blocks, events, notifier
// =============================================================================

/// Directory of local calendars under `LOCAL_DOMAIN`
pub struct StaticDirectory {
    handles: Mutex<HashSet<String>>,
}

impl StaticDirectory {
    pub fn new(handles: &[&str]) -> Self {
        Self {
            handles: Mutex::new(handles.iter().map(|h| h.to_string()).collect()),
        }
    }

    fn lookup(&self, handle: &str) -> Option<CalendarId> {
        let handles = self.handles.lock().unwrap();
        handles
            .iter()
            .find(|known| known.eq_ignore_ascii_case(handle))
            .map(|known| CalendarId::new(known.clone()))
    }
}

#[async_trait]
impl LocalCalendarDirectory for StaticDirectory {
    async fn calendar_for_object(
        &self,
        object: &Url,
    ) -> Result<Option<CalendarId>, FederationError> {
        if object.scheme() == "acct" {
            let Some((handle, domain)) = object.path().split_once('@') else {
                return Ok(None);
            };
            if !domain.eq_ignore_ascii_case(LOCAL_DOMAIN) {
                return Ok(None);
            }
            return Ok(self.lookup(handle));
        }

        let host_matches = object
            .host_str()
            .is_some_and(|host| host.eq_ignore_ascii_case(LOCAL_DOMAIN));
        if !host_matches {
            return Ok(None);
        }

        let path = object.path().trim_end_matches('/');
        let Some(handle) = path.strip_prefix("/calendars/") else {
            return Ok(None);
        };
        Ok(self.lookup(handle))
    }

    async fn calendar_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<CalendarId>, FederationError> {
        Ok(self.lookup(handle))
    }

    async fn actor_uri(&self, calendar: &CalendarId) -> Result<Url, FederationError> {
        Url::parse(&format!("{LOCAL_BASE_URL}/calendars/{calendar}"))
            .map_err(|e| FederationError::Internal(e.into()))
    }
}

pub struct StaticBlocks {
    blocked: Mutex<HashSet<String>>,
}

impl StaticBlocks {
    pub fn new() -> Self {
        Self {
            blocked: Mutex::new(HashSet::new()),
        }
    }

    pub fn block(&self, domain: &str) {
        self.blocked.lock().unwrap().insert(domain.to_string());
    }
}

#[async_trait]
impl DomainBlockPolicy for StaticBlocks {
    async fn is_blocked(&self, domain: &str) -> Result<bool, FederationError> {
        Ok(self.blocked.lock().unwrap().contains(domain))
    }
}

/// Records what the engine hands to the event store
pub struct RecordingEvents {
    created: Mutex<Vec<FederatedEvent>>,
    announced: Mutex<Vec<Url>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            announced: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<FederatedEvent> {
        self.created.lock().unwrap().clone()
    }

    pub fn announced(&self) -> Vec<Url> {
        self.announced.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventIngest for RecordingEvents {
    async fn event_created(
        &self,
        _actor: &RemoteActor,
        event: FederatedEvent,
    ) -> Result<(), FederationError> {
        self.created.lock().unwrap().push(event);
        Ok(())
    }

    async fn event_announced(
        &self,
        _actor: &RemoteActor,
        event_uri: Url,
    ) -> Result<(), FederationError> {
        self.announced.lock().unwrap().push(event_uri);
        Ok(())
    }
}

/// Records relationship transitions and delivery outcomes
pub struct RecordingNotifier {
    relationships: Mutex<Vec<FollowRelationship>>,
    delivered: Mutex<Vec<DeliveryAttempt>>,
    failures: Mutex<Vec<(DeliveryAttempt, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            relationships: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn relationship_events(&self) -> Vec<FollowRelationship> {
        self.relationships.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<DeliveryAttempt> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<(DeliveryAttempt, String)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl FederationNotifier for RecordingNotifier {
    async fn relationship_changed(&self, relationship: &FollowRelationship) {
        self.relationships.lock().unwrap().push(relationship.clone());
    }

    async fn activity_delivered(&self, attempt: &DeliveryAttempt) {
        self.delivered.lock().unwrap().push(attempt.clone());
    }

    async fn delivery_failed(&self, attempt: &DeliveryAttempt, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((attempt.clone(), reason.to_string()));
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Clock whose time only moves when the test advances it
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap()
    }
}

// =============================================================================
// Harness
// =============================================================================

pub fn test_config() -> FederationConfig {
    FederationConfig {
        instance: InstanceConfig {
            domain: LOCAL_DOMAIN.to_string(),
            protocol: "https".to_string(),
            name: "Almanac test".to_string(),
        },
        resolver: ResolverConfig::default(),
        delivery: DeliveryConfig::default(),
    }
}

/// Fully wired engine over in-memory fakes
pub struct Harness {
    pub state: FederationState,
    pub store: Arc<MemoryRelationshipStore>,
    pub discovery: Arc<FakeDiscovery>,
    pub transport: Arc<FakeTransport>,
    pub notifier: Arc<RecordingNotifier>,
    pub events: Arc<RecordingEvents>,
    pub directory: Arc<StaticDirectory>,
    pub blocks: Arc<StaticBlocks>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_verifier(Arc::new(AcceptAllVerifier), test_config())
    }

    pub fn with_config(config: FederationConfig) -> Self {
        Self::with_verifier(Arc::new(AcceptAllVerifier), config)
    }

    pub fn rejecting_signatures() -> Self {
        Self::with_verifier(Arc::new(DenyAllVerifier), test_config())
    }

    fn with_verifier(verifier: Arc<dyn SignatureVerifier>, config: FederationConfig) -> Self {
        init_tracing();

        let store = Arc::new(MemoryRelationshipStore::new());
        let discovery = Arc::new(FakeDiscovery::new());
        let transport = Arc::new(FakeTransport::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let events = Arc::new(RecordingEvents::new());
        let directory = Arc::new(StaticDirectory::new(&["cal-1", "cal-2"]));
        let blocks = Arc::new(StaticBlocks::new());
        let clock = Arc::new(ManualClock::new());

        let state = FederationState::new(
            config,
            Collaborators {
                store: store.clone(),
                directory: directory.clone(),
                blocks: blocks.clone(),
                signer: Arc::new(NoopSigner),
                verifier,
                events: events.clone(),
                notifier: notifier.clone(),
                transport: Some(transport.clone()),
                discovery: Some(discovery.clone()),
                clock: Some(clock.clone()),
            },
        )
        .expect("federation state builds");

        Self {
            state,
            store,
            discovery,
            transport,
            notifier,
            events,
            directory,
            blocks,
            clock,
        }
    }

    /// Inbound envelope carrying a signed activity body
    pub fn signed_envelope(&self, activity: &serde_json::Value) -> InboundEnvelope {
        InboundEnvelope {
            body: serde_json::to_vec(activity).unwrap(),
            signature: Some("keyId=\"remote\",signature=\"test\"".to_string()),
            date: Some("Thu, 01 Jan 2026 00:00:00 GMT".to_string()),
            digest: Some("SHA-256=test".to_string()),
        }
    }

    /// Inbound envelope with no Signature header
    pub fn unsigned_envelope(&self, activity: &serde_json::Value) -> InboundEnvelope {
        InboundEnvelope {
            body: serde_json::to_vec(activity).unwrap(),
            signature: None,
            date: None,
            digest: None,
        }
    }
}

/// Serialize an activity for wire-level assertions
pub fn activity_json(activity: &Activity) -> serde_json::Value {
    serde_json::to_value(activity).unwrap()
}
