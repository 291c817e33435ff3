use thiserror::Error;

/// Everything that can go wrong while driving one session through the
/// generation flow. The workflow matches on these to decide which state a
/// session lands in, so each failure class gets its own variant rather than
/// an opaque string.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid username or password")]
    Auth,

    #[error("describe your dream before generating an image")]
    EmptyDream,

    #[error("generation limit reached for {username}")]
    QuotaExceeded { username: String },

    #[error("prompt translation failed: {0}")]
    Translation(String),

    #[error("unsupported reference image format: {0}")]
    UnsupportedFormat(String),

    #[error("reference image upload failed: {0}")]
    Upload(String),

    #[error("image generation failed: {0}")]
    Generation(String),

    #[error("image generation timed out after {elapsed_secs}s")]
    GenerationTimeout { elapsed_secs: u64 },

    #[error("image download failed: {0}")]
    Fetch(String),

    #[error("image data could not be decoded: {0}")]
    Decode(String),

    #[error("image encoding failed: {0}")]
    Encode(String),

    #[error("no candidate at index {index} (got {count})")]
    InvalidSelection { index: usize, count: usize },

    #[error("email delivery failed: {0}")]
    Delivery(String),

    #[error("an email was already sent in the last {cooldown_mins} minutes")]
    EmailRateLimited { cooldown_mins: i64 },

    #[error("{action} is not available while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
}

impl WorkflowError {
    /// Stable machine-readable tag used in the session event log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::EmptyDream => "empty_dream",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Translation(_) => "translation",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Upload(_) => "upload",
            Self::Generation(_) => "generation",
            Self::GenerationTimeout { .. } => "generation_timeout",
            Self::Fetch(_) => "fetch",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::InvalidSelection { .. } => "invalid_selection",
            Self::Delivery(_) => "delivery",
            Self::EmailRateLimited { .. } => "email_rate_limited",
            Self::InvalidTransition { .. } => "invalid_transition",
        }
    }
}
