//! Certificate store watcher
//!
//! The hub kubeconfig directory holds three files written by the registration
//! sub-process:
//!
//! | File | Content |
//! |---|---|
//! | `kubeconfig` | hub server, CA and paths to the two files below |
//! | `tls.key` | PEM private key |
//! | `tls.crt` | PEM client certificate (leaf first) |
//!
//! [`CertificateStore::check`] derives a [`TrustState`] from whatever is on
//! disk right now. Checks run cheapest first and stop at the first failure:
//! kubeconfig exists, key exists, certificate readable, certificate parses,
//! identity matches, certificate is within its validity window.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use x509_parser::prelude::*;

use crate::error::CertError;
use crate::identity::{leaf_common_name, AgentIdentity};

/// Hub kubeconfig file name
pub const KUBECONFIG_FILE: &str = "kubeconfig";
/// Client key file name
pub const TLS_KEY_FILE: &str = "tls.key";
/// Client certificate file name
pub const TLS_CERT_FILE: &str = "tls.crt";
/// File persisting a generated agent name across restarts
pub const AGENT_NAME_FILE: &str = "agent-name";

/// Fraction of the certificate lifetime after which it is re-issued
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Paths inside the hub kubeconfig directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubKubeconfigDir {
    dir: PathBuf,
}

impl HubKubeconfigDir {
    /// Wrap a directory path
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory itself
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// `{dir}/kubeconfig`
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.dir.join(KUBECONFIG_FILE)
    }

    /// `{dir}/tls.key`
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(TLS_KEY_FILE)
    }

    /// `{dir}/tls.crt`
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(TLS_CERT_FILE)
    }

    /// `{dir}/agent-name`
    pub fn agent_name_path(&self) -> PathBuf {
        self.dir.join(AGENT_NAME_FILE)
    }
}

/// Trust derived from the certificate directory at one point in time
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustState {
    /// No hub kubeconfig yet
    Absent,
    /// Kubeconfig present, private key missing
    KeyMissing,
    /// Certificate file missing or unreadable
    CertUnreadable,
    /// Certificate was issued for someone else
    IdentityMismatch {
        /// Identity (or raw common name) found in the certificate
        found: String,
    },
    /// Certificate unparseable, expired or not yet valid
    Invalid {
        /// Why the certificate was rejected
        reason: String,
    },
    /// Certificate matches our identity and is currently valid
    Valid,
}

impl TrustState {
    /// Whether the state unblocks the agent
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "hub kubeconfig not found"),
            Self::KeyMissing => write!(f, "tls key not found"),
            Self::CertUnreadable => write!(f, "tls certificate unreadable"),
            Self::IdentityMismatch { found } => {
                write!(f, "certificate issued for {}", found)
            }
            Self::Invalid { reason } => write!(f, "certificate invalid: {}", reason),
            Self::Valid => write!(f, "valid"),
        }
    }
}

/// Something that can report the current trust state
#[cfg_attr(test, mockall::automock)]
pub trait TrustProbe: Send + Sync {
    /// Derive the current trust state for `expected`
    fn probe(&self, expected: &AgentIdentity) -> TrustState;
}

/// Filesystem-backed certificate store
#[derive(Clone, Debug)]
pub struct CertificateStore {
    dir: HubKubeconfigDir,
}

impl CertificateStore {
    /// Watch the given hub kubeconfig directory
    pub fn new(dir: HubKubeconfigDir) -> Self {
        Self { dir }
    }

    /// Directory being watched
    pub fn dir(&self) -> &HubKubeconfigDir {
        &self.dir
    }

    /// Derive the trust state at `now`. Pure read; never fails.
    pub fn check_at(&self, expected: &AgentIdentity, now: DateTime<Utc>) -> TrustState {
        if !self.dir.kubeconfig_path().exists() {
            return TrustState::Absent;
        }
        if !self.dir.key_path().exists() {
            return TrustState::KeyMissing;
        }
        let cert = match std::fs::read(self.dir.cert_path()) {
            Ok(data) => data,
            Err(_) => return TrustState::CertUnreadable,
        };
        // Parse failures are retryable; the file may be mid-rotation.
        let cn = match leaf_common_name(&cert) {
            Ok(cn) => cn,
            Err(e) => {
                return TrustState::Invalid {
                    reason: e.to_string(),
                }
            }
        };
        match AgentIdentity::from_common_name(&cn) {
            Some(found) if &found == expected => {}
            Some(found) => {
                return TrustState::IdentityMismatch {
                    found: found.to_string(),
                }
            }
            None => return TrustState::IdentityMismatch { found: cn },
        }
        match check_validity(&cert, now) {
            Ok(()) => TrustState::Valid,
            Err(e) => TrustState::Invalid {
                reason: e.to_string(),
            },
        }
    }

    /// Derive the trust state now
    pub fn check(&self, expected: &AgentIdentity) -> TrustState {
        self.check_at(expected, Utc::now())
    }
}

impl TrustProbe for CertificateStore {
    fn probe(&self, expected: &AgentIdentity) -> TrustState {
        self.check(expected)
    }
}

/// Validity window of one certificate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CertificateLifetime {
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

impl CertificateLifetime {
    /// Validity window of the leaf certificate in a PEM bundle
    pub fn from_pem(cert_pem: &[u8]) -> Result<Self, CertError> {
        let blocks = parse_certificates(cert_pem)?;
        let leaf = blocks.first().ok_or(CertError::NoCertificates)?;
        lifetime_of(leaf.contents())
    }

    /// Whether `now` falls inside the window
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whether the rotation threshold of the lifetime has elapsed at `now`
    pub fn needs_rotation(&self, now: DateTime<Utc>) -> bool {
        let total = (self.not_after - self.not_before).num_seconds();
        if total <= 0 {
            return true;
        }
        let elapsed = (now - self.not_before).num_seconds();
        elapsed as f64 >= total as f64 * ROTATION_THRESHOLD
    }
}

/// Error describing why a certificate bundle is not currently valid
#[derive(Debug, PartialEq, Eq)]
pub struct ValidityError(String);

impl fmt::Display for ValidityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check every certificate in the bundle is within its validity window
pub fn check_validity(cert_pem: &[u8], now: DateTime<Utc>) -> Result<(), ValidityError> {
    let blocks = parse_certificates(cert_pem).map_err(|e| ValidityError(e.to_string()))?;
    if blocks.is_empty() {
        return Err(ValidityError(CertError::NoCertificates.to_string()));
    }
    for (index, block) in blocks.iter().enumerate() {
        let lifetime = lifetime_of(block.contents()).map_err(|e| ValidityError(e.to_string()))?;
        if now < lifetime.not_before {
            return Err(ValidityError(format!(
                "certificate {} not valid before {}",
                index, lifetime.not_before
            )));
        }
        if now > lifetime.not_after {
            return Err(ValidityError(format!(
                "certificate {} expired at {}",
                index, lifetime.not_after
            )));
        }
    }
    Ok(())
}

fn parse_certificates(cert_pem: &[u8]) -> Result<Vec<::pem::Pem>, CertError> {
    let blocks = ::pem::parse_many(cert_pem).map_err(|e| CertError::Parse(e.to_string()))?;
    Ok(blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .collect())
}

fn lifetime_of(der: &[u8]) -> Result<CertificateLifetime, CertError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| CertError::Parse(format!("failed to parse certificate: {}", e)))?;
    let validity = cert.validity();
    let to_utc = |t: ASN1Time| {
        DateTime::<Utc>::from_timestamp(t.timestamp(), 0)
            .ok_or_else(|| CertError::Parse(format!("timestamp out of range: {}", t)))
    };
    Ok(CertificateLifetime {
        not_before: to_utc(validity.not_before)?,
        not_after: to_utc(validity.not_after)?,
    })
}
