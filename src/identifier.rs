//! Remote calendar identifiers
//!
//! Parses and validates `username@domain` handles used to address
//! calendars on other servers. Parsing is pure and synchronous; the
//! resulting identifier is immutable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FederationError;

/// A validated `localpart@domain` handle for a remote calendar
///
/// Invariants, enforced at parse time:
/// - exactly one `@`
/// - local part non-empty, characters limited to `[A-Za-z0-9_.\-]`
/// - domain a syntactically valid hostname with no scheme, path, or port
///
/// The domain is normalized to lowercase so equal handles hash equally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteCalendarIdentifier {
    local_part: String,
    domain: String,
}

impl RemoteCalendarIdentifier {
    /// Local part of the handle (the calendar name on the remote server)
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    /// Hostname of the remote server, lowercase
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// `acct:` URI form used as a WebFinger resource and Follow target
    pub fn acct_uri(&self) -> String {
        format!("acct:{}@{}", self.local_part, self.domain)
    }
}

fn is_valid_local_part(local_part: &str) -> bool {
    !local_part.is_empty()
        && local_part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.contains([':', '/', '?', '#']) {
        return false;
    }

    url::Host::parse(domain).is_ok()
}

impl FromStr for RemoteCalendarIdentifier {
    type Err = FederationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let raw = raw.strip_prefix("acct:").unwrap_or(raw);

        let Some((local_part, domain)) = raw.split_once('@') else {
            return Err(FederationError::InvalidIdentifier(format!(
                "expected localpart@domain, got {raw:?}"
            )));
        };

        if domain.contains('@') {
            return Err(FederationError::InvalidIdentifier(format!(
                "more than one @ in {raw:?}"
            )));
        }

        if !is_valid_local_part(local_part) {
            return Err(FederationError::InvalidIdentifier(format!(
                "invalid local part in {raw:?}"
            )));
        }

        if !is_valid_domain(domain) {
            return Err(FederationError::InvalidIdentifier(format!(
                "invalid domain in {raw:?}"
            )));
        }

        Ok(Self {
            local_part: local_part.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for RemoteCalendarIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl TryFrom<String> for RemoteCalendarIdentifier {
    type Error = FederationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RemoteCalendarIdentifier> for String {
    fn from(identifier: RemoteCalendarIdentifier) -> Self {
        identifier.to_string()
    }
}
