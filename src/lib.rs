//! Almanac federation engine
//!
//! The federation subsystem of the Almanac calendar platform: resolving
//! remote calendar identities, exchanging signed activities with servers
//! that are not trusted a priori, and keeping cross-server follow
//! relationships consistent in the face of unreliable remotes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     HTTP Surface (Axum)                     │
//! │  - WebFinger for local calendars                            │
//! │  - Inbox endpoint, relationship listing, metrics            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Core                          │
//! │  - Actor resolver (WebFinger discovery, TTL cache)          │
//! │  - Follow state machine                                     │
//! │  - Inbox dispatcher (verify, dedupe, route)                 │
//! │  - Outbox dispatcher (per-inbox FIFO, retry/backoff)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Host Application (collaborators)               │
//! │  - Relationship storage, calendar directory                 │
//! │  - Signature crypto, block policy, event store              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `identifier`: `user@domain` handle parsing
//! - `activity`: typed activity model and builders
//! - `event`: federated event wire objects
//! - `resolver`: actor identity resolution and caching
//! - `follow`: follow relationship lifecycle
//! - `inbox`/`outbox`: inbound dispatch and outbound delivery
//! - `store`/`policy`/`signing`: collaborator seams
//! - `config`, `error`, `metrics`, `api`

pub mod activity;
pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod follow;
pub mod identifier;
pub mod inbox;
pub mod metrics;
pub mod outbox;
pub mod policy;
pub mod resolver;
pub mod signing;
pub mod store;

use std::sync::Arc;

use crate::error::FederationError;
use crate::follow::FollowService;
use crate::inbox::InboxDispatcher;
use crate::outbox::{
    ActivityTransport, HttpActivityTransport, OutboxDispatcher, RetryPolicy,
};
use crate::policy::{DomainBlockPolicy, EventIngest, FederationNotifier, LocalCalendarDirectory};
use crate::resolver::{ActorResolver, Clock, DiscoveryClient, HttpDiscoveryClient, SystemClock};
use crate::signing::{RequestSigner, SignatureVerifier};
use crate::store::RelationshipStore;

/// Capabilities the host application supplies
///
/// Transport, discovery, and clock default to the HTTP/system
/// implementations when left unset; tests inject fakes there.
pub struct Collaborators {
    pub store: Arc<dyn RelationshipStore>,
    pub directory: Arc<dyn LocalCalendarDirectory>,
    pub blocks: Arc<dyn DomainBlockPolicy>,
    pub signer: Arc<dyn RequestSigner>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub events: Arc<dyn EventIngest>,
    pub notifier: Arc<dyn FederationNotifier>,
    pub transport: Option<Arc<dyn ActivityTransport>>,
    pub discovery: Option<Arc<dyn DiscoveryClient>>,
    pub clock: Option<Arc<dyn Clock>>,
}

/// Federation state shared across all handlers
///
/// Cloned per request; every field is shared behind an `Arc`.
#[derive(Clone)]
pub struct FederationState {
    /// Federation configuration
    pub config: Arc<config::FederationConfig>,

    /// Actor resolution cache
    pub resolver: Arc<ActorResolver>,

    /// Follow state machine
    pub follows: Arc<FollowService>,

    /// Inbound activity dispatcher
    pub inbox: Arc<InboxDispatcher>,

    /// Outbound delivery dispatcher
    pub outbox: OutboxDispatcher,

    /// Local calendar directory (also used by WebFinger serving)
    pub directory: Arc<dyn LocalCalendarDirectory>,
}

impl FederationState {
    /// Wire up the federation engine
    ///
    /// # Steps
    /// 1. Validate configuration
    /// 2. Build the HTTP client with a bounded timeout
    /// 3. Construct resolver, outbox, follow service, inbox
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be built
    pub fn new(
        config: config::FederationConfig,
        collaborators: Collaborators,
    ) -> Result<Self, FederationError> {
        config.validate()?;
        metrics::init_metrics();

        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(concat!("Almanac/", env!("CARGO_PKG_VERSION")))
                .timeout(config.resolver.request_timeout())
                .build()
                .map_err(|e| FederationError::Internal(e.into()))?,
        );
        let config = Arc::new(config);

        let discovery = collaborators
            .discovery
            .unwrap_or_else(|| Arc::new(HttpDiscoveryClient::new(http_client.clone())));
        let clock = collaborators
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock));
        let resolver = Arc::new(ActorResolver::new(
            discovery,
            clock,
            config.resolver.actor_ttl(),
        ));

        let transport = collaborators
            .transport
            .unwrap_or_else(|| Arc::new(HttpActivityTransport::new(http_client.clone())));
        let outbox = OutboxDispatcher::new(
            transport,
            collaborators.signer,
            collaborators.notifier.clone(),
            resolver.clone(),
            RetryPolicy::from_config(&config.delivery),
        );

        let follows = Arc::new(FollowService::new(
            config.clone(),
            resolver.clone(),
            collaborators.store,
            outbox.clone(),
            collaborators.directory.clone(),
            collaborators.blocks.clone(),
            collaborators.notifier,
        ));

        let inbox = Arc::new(InboxDispatcher::new(
            resolver.clone(),
            collaborators.verifier,
            collaborators.blocks,
            follows.clone(),
            collaborators.events,
        ));

        tracing::info!(
            domain = %config.instance.domain,
            "federation engine initialized"
        );

        Ok(Self {
            config,
            resolver,
            follows,
            inbox,
            outbox,
            directory: collaborators.directory,
        })
    }
}

/// Build the Axum router with all federation routes.
///
/// This is shared by the host application and integration tests to keep
/// route composition consistent across environments.
pub fn build_router(state: FederationState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::federation_router())
        .merge(api::metrics_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
