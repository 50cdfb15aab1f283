//! Error types for hub trust and registration

use std::path::PathBuf;

use thiserror::Error;

/// Errors reading a client certificate
#[derive(Debug, Error)]
pub enum CertError {
    /// PEM or DER could not be decoded
    #[error("failed to parse certificate: {0}")]
    Parse(String),

    /// The leaf certificate has no subject common name
    #[error("certificate has no common name")]
    MissingCommonName,

    /// The bundle contained no certificate blocks
    #[error("no certificates found")]
    NoCertificates,
}

/// Errors from waiting on hub trust
#[derive(Debug, Error)]
pub enum TrustError {
    /// Shutdown was requested before a valid certificate appeared
    #[error("cancelled while waiting for hub trust (last state: {last_state})")]
    Cancelled {
        /// Description of the last observed trust state
        last_state: String,
    },
}

/// Errors from the registration sub-process
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Kubernetes API or client construction error
    #[error(transparent)]
    Api(#[from] spoke_common::Error),

    /// The hub denied or failed our certificate signing request
    #[error("certificate signing request {name} was {outcome}: {message}")]
    CsrRejected {
        /// CSR object name
        name: String,
        /// "Denied" or "Failed"
        outcome: String,
        /// Message from the condition
        message: String,
    },

    /// Reading or writing credential files failed
    #[error("failed to {action} {path}: {source}")]
    Io {
        /// What was attempted ("write", "read", "rename")
        action: &'static str,
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The bootstrap kubeconfig is unusable or the hub kubeconfig could not be rendered
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(String),

    /// Key or CSR generation failed
    #[error("failed to generate credentials: {0}")]
    KeyGeneration(String),

    /// A certificate we received or stored could not be read
    #[error(transparent)]
    Certificate(#[from] CertError),

    /// Shutdown was requested mid-operation
    #[error("registration cancelled")]
    Cancelled,
}

impl RegistrationError {
    /// Whether the registration loop should retry after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.is_retryable(),
            Self::Io { .. } => true,
            Self::CsrRejected { .. }
            | Self::Kubeconfig(_)
            | Self::KeyGeneration(_)
            | Self::Certificate(_)
            | Self::Cancelled => false,
        }
    }
}

impl From<kube::Error> for RegistrationError {
    fn from(e: kube::Error) -> Self {
        Self::Api(e.into())
    }
}
