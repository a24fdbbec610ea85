use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Fatal for the acquisition session, the stream halts.
    #[error("device read failed: {0}")]
    DeviceRead(String),
    /// Per chunk, the chunk is dropped and the worker stays available.
    #[error("projection failed: {0}")]
    Projection(String),
    /// Per fit, the previous fit result stays visible.
    #[error("fit did not converge: {0}")]
    FitConvergence(String),
    /// Rejected at the call site, state unchanged.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("manager disconnected")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DeviceRead(_))
    }
}
