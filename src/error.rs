use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum HarvestError {
    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationError(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Session crashed: {0}")]
    SessionCrash(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Script evaluation failed: {0}")]
    ScriptError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Table error: {0}")]
    TableError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl HarvestError {
    /// Soft errors send the caller down its fallback path (next contact path,
    /// homepage scan, sentinel field) instead of ending the owning task.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            HarvestError::NavigationTimeout(_)
                | HarvestError::NavigationError(_)
                | HarvestError::ElementNotFound(_)
                | HarvestError::ScriptError(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HarvestError::NavigationTimeout(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HarvestError::ElementNotFound(_) => ErrorSeverity::Low,
            HarvestError::NavigationTimeout(_) => ErrorSeverity::Low,
            HarvestError::NavigationError(_) => ErrorSeverity::Low,
            HarvestError::ScriptError(_) => ErrorSeverity::Medium,
            HarvestError::SessionCrash(_) => ErrorSeverity::High,
            HarvestError::ConfigurationError(_) => ErrorSeverity::High,
            HarvestError::BrowserLaunchFailed(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// High and critical failures are logged as errors, the rest as warnings.
    pub fn is_alerting(self) -> bool {
        matches!(self, ErrorSeverity::High | ErrorSeverity::Critical)
    }
}

impl From<std::io::Error> for HarvestError {
    fn from(err: std::io::Error) -> Self {
        HarvestError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        HarvestError::SerializationError(err.to_string())
    }
}

impl From<csv::Error> for HarvestError {
    fn from(err: csv::Error) -> Self {
        HarvestError::TableError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_failures_are_soft() {
        assert!(HarvestError::NavigationTimeout(Duration::from_secs(15)).is_soft());
        assert!(HarvestError::NavigationError("net::ERR_NAME_NOT_RESOLVED".to_string()).is_soft());
        assert!(HarvestError::ElementNotFound("body".to_string()).is_soft());
    }

    #[test]
    fn session_crash_is_fatal() {
        let crash = HarvestError::SessionCrash("handler stream ended".to_string());
        assert!(!crash.is_soft());
        assert_eq!(crash.severity(), ErrorSeverity::High);
    }

    #[test]
    fn timeout_message_carries_duration() {
        let err = HarvestError::NavigationTimeout(Duration::from_secs(15));
        assert_eq!(err.to_string(), "Navigation timed out after 15s");
    }
}
