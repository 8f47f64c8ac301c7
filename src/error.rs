#[derive(Debug, thiserror::Error)]
pub enum GuardianClientError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Connectivity error: {0}")]
    Connectivity(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("A VoIP test is already running")]
    Busy,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
