pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// No valid credentials; the daemon halts until re-authorized
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Network or timeout failure on a collaborator call; retried next cycle
    #[error("transient fetch failure: {0}")]
    TransientFetchFailure(String),

    /// The pooled resource could not be acquired in time
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A collaborator returned something that cannot be applied
    #[error("data inconsistency: {0}")]
    DataInconsistency(String),
}

impl SyncError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientFetchFailure(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable(msg.into())
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::DataInconsistency(msg.into())
    }

    /// True when the daemon has to stop and wait for re-authorization
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::DataInconsistency(format!("undecodable response: {}", err))
        } else {
            Self::TransientFetchFailure(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::DataInconsistency(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::TransientFetchFailure(format!("io: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_are_inconsistencies() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::DataInconsistency(_)));
    }

    #[test]
    fn only_unauthorized_halts() {
        assert!(SyncError::unauthorized("expired").is_unauthorized());
        assert!(!SyncError::transient("timeout").is_unauthorized());
        assert_eq!(
            SyncError::unavailable("pool busy").to_string(),
            "resource unavailable: pool busy"
        );
    }
}
