//! HTTP signature seams
//!
//! The actual signature scheme is supplied by the surrounding
//! application; this module only defines the header material the outbox
//! attaches and the verification capability the inbox consumes.

use async_trait::async_trait;
use url::Url;

use crate::error::FederationError;
use crate::resolver::RemoteActor;

/// Headers produced by signing an outgoing request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// `Date` header value
    pub date: String,
    /// `Digest` header value, present when the request has a body
    pub digest: Option<String>,
    /// `Signature` header value
    pub signature: String,
}

/// The inbound request material needed for verification
#[derive(Debug, Clone, Default)]
pub struct InboundEnvelope {
    /// Raw request body
    pub body: Vec<u8>,
    /// Raw `Signature` header, if present
    pub signature: Option<String>,
    /// Raw `Date` header
    pub date: Option<String>,
    /// Raw `Digest` header
    pub digest: Option<String>,
}

/// Signs outgoing federation requests with the local actor's key
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(
        &self,
        method: &str,
        target: &Url,
        body: &[u8],
    ) -> Result<SignatureHeaders, FederationError>;
}

/// Verifies an inbound request against the sender's published key
///
/// Returns `Ok(false)` for a well-formed but invalid signature; errors
/// are reserved for verification machinery failures.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(
        &self,
        actor: &RemoteActor,
        envelope: &InboundEnvelope,
    ) -> Result<bool, FederationError>;
}
