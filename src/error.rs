//! Error types for the cluster deployer

use std::time::Duration;

use thiserror::Error;

/// Main error type for deployer operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid bootstrap input (missing names, missing master, ...)
    #[error("validation error: {0}")]
    Validation(String),

    /// The version string could not be parsed
    #[error("invalid version {version:?}: {reason}")]
    InvalidVersion {
        /// The version as requested
        version: String,
        /// Why parsing failed
        reason: String,
    },

    /// Pre-release versions are never provisioned
    #[error("pre-release versions are not supported: {0}")]
    UnsupportedVersion(String),

    /// The compatibility table has no entry for the requested minor version
    #[error("{component} version is unknown for Kubernetes version {version}")]
    UnknownCompatibleVersion {
        /// Companion component whose version could not be found
        component: &'static str,
        /// The version as requested
        version: String,
    },

    /// A bounded wait ran out of time
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// The condition that never became true
        what: String,
        /// The configured timeout
        timeout: Duration,
    },

    /// The machine-creation collaborator failed
    #[error("provider error: {0}")]
    Provider(String),

    /// The object store rejected a create because the name is taken
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: &'static str,
        /// Resource name
        name: String,
    },

    /// Batch machine creation stopped at the first failure
    #[error("machine batch stopped at {machine} after {created} machine(s) created: {source}")]
    PartialBatch {
        /// Number of machines created before the failure
        created: usize,
        /// Machine whose creation failed
        machine: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A machine in the batch failed a check; the cause keeps its variant
    #[error("machine {name}: {source}")]
    Machine {
        /// Machine the error belongs to
        name: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Script fragment rendering error
    #[error("template error: {0}")]
    Template(String),

    /// Invalid deployer configuration (compatibility table, CLI inputs)
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error for the given condition
    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
        }
    }

    /// Attach a machine name to an error
    pub fn for_machine(name: impl Into<String>, source: Error) -> Self {
        Self::Machine {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// The error with any machine wrapper removed
    pub fn root(&self) -> &Error {
        match self {
            Self::Machine { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the object store refused a duplicate name
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// True for input errors that must never be retried
    pub fn is_input_error(&self) -> bool {
        matches!(
            self.root(),
            Self::Validation(_)
                | Self::InvalidVersion { .. }
                | Self::UnsupportedVersion(_)
                | Self::UnknownCompatibleVersion { .. }
                | Self::Config(_)
        )
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Self::Template(e.to_string())
    }
}
