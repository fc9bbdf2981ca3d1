#[derive(Debug, thiserror::Error)]
pub enum FlowXError {
    /// Returned by a shedder when the admission check rejects the request.
    #[error("service overloaded")]
    Overloaded,
    /// Returned by a picker whose candidate set is empty.
    #[error("no backend available")]
    NoBackendAvailable,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl FlowXError {
    /// Overload-class errors are advisory: the caller may retry elsewhere.
    pub fn is_overload(&self) -> bool {
        matches!(self, FlowXError::Overloaded | FlowXError::NoBackendAvailable)
    }
}
