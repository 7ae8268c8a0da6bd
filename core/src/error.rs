use thiserror::Error;

/// Classification of a failed registry call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryErrorKind {
    /// Manifest or blob does not exist
    NotFound,
    /// Authentication or authorization failure
    Unauthorized,
    /// The registry refused the content (unsupported media type, invalid manifest)
    Rejected,
    /// Connection failure, 5xx or rate limiting; safe to retry
    Transient,
    /// Anything else
    Other,
}

impl std::fmt::Display for RegistryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistryErrorKind::NotFound => "not found",
            RegistryErrorKind::Unauthorized => "unauthorized",
            RegistryErrorKind::Rejected => "rejected",
            RegistryErrorKind::Transient => "transient",
            RegistryErrorKind::Other => "error",
        };
        f.write_str(s)
    }
}

/// CNAB push error types
#[derive(Error, Debug)]
pub enum PushError {
    /// Reference string could not be parsed
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Source image manifest could not be fetched
    #[error("Failed to resolve image {image}: {source}")]
    Resolution {
        image: String,
        source: Box<PushError>,
    },

    /// Image content could not be copied to the target repository
    #[error("Failed to copy image {image}: {source}")]
    Copy {
        image: String,
        source: Box<PushError>,
    },

    /// Bundle manifest upload failed
    #[error("Failed to push bundle to {target}: {source}")]
    Push {
        target: String,
        source: Box<PushError>,
    },

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry {
        registry: String,
        kind: RegistryErrorKind,
        message: String,
    },

    /// Bundle references an image outside the target repository
    #[error("Dangling reference: image {image} is not fixed up to {target}")]
    DanglingReference { image: String, target: String },

    /// Local credential store could not be read
    #[error("Credential error: {0}")]
    Credential(String),

    /// Bundle could not be loaded or located
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for PushError {
    fn from(err: serde_json::Error) -> Self {
        PushError::Serialization(err.to_string())
    }
}

impl PushError {
    /// Build a registry error.
    pub fn registry(
        registry: impl Into<String>,
        kind: RegistryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        PushError::Registry {
            registry: registry.into(),
            kind,
            message: message.into(),
        }
    }

    /// Registry classification of this error, looking through context wrappers.
    pub fn registry_kind(&self) -> Option<RegistryErrorKind> {
        match self {
            PushError::Registry { kind, .. } => Some(*kind),
            PushError::Resolution { source, .. }
            | PushError::Copy { source, .. }
            | PushError::Push { source, .. } => source.registry_kind(),
            _ => None,
        }
    }

    /// Whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        self.registry_kind() == Some(RegistryErrorKind::Transient)
    }

    /// Whether the registry refused the content itself.
    pub fn is_rejected(&self) -> bool {
        self.registry_kind() == Some(RegistryErrorKind::Rejected)
    }

    /// Whether the requested manifest or blob does not exist.
    pub fn is_not_found(&self) -> bool {
        self.registry_kind() == Some(RegistryErrorKind::NotFound)
    }
}

/// Result type alias for CNAB push operations
pub type Result<T> = std::result::Result<T, PushError>;
