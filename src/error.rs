//! Error taxonomy shared by every scanning component.
use std::time::Duration;

use thiserror::Error;

/// Errors produced while probing candidates or tuning fragmentation.
///
/// Per-attempt errors (config generation, engine start, readiness timeout,
/// network test) are recoverable: the worker retries them and, once retries
/// are exhausted, records the final message on the candidate's result. The
/// remaining variants are fatal and abort the run before any work starts,
/// except [`ScanError::Cancelled`] which marks a deliberate abort.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The engine collaborator could not materialize a configuration.
    #[error("config generation failed: {0}")]
    ConfigGeneration(String),

    /// The engine process refused to start.
    #[error("engine start failed: {0}")]
    EngineStart(String),

    /// The engine's local port never started accepting connections.
    #[error("engine not ready after {0:?}")]
    EngineNotReady(Duration),

    /// Request/transport failure, status-code rejection or over-ceiling
    /// latency during a network measurement.
    #[error("network test failed: {0}")]
    NetworkTest(String),

    /// The candidate source produced an empty set. Fatal.
    #[error("no candidates loaded from {0:?}")]
    NoCandidates(String),

    /// The run was aborted by the root cancellation signal. Distinguished
    /// from ordinary failures so callers can tell "aborted" from "tried
    /// and failed".
    #[error("cancelled")]
    Cancelled,

    /// The golden-ratio constant failed its startup integrity check. Fatal.
    #[error("search constant integrity check failed: phi was {0}")]
    SearchConfigIntegrity(f64),
}

impl ScanError {
    /// Whether this error may be retried within an attempt sequence.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConfigGeneration(_)
                | Self::EngineStart(_)
                | Self::EngineNotReady(_)
                | Self::NetworkTest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_errors_are_recoverable() {
        assert!(ScanError::ConfigGeneration("bad uuid".into()).is_recoverable());
        assert!(ScanError::EngineNotReady(Duration::from_secs(4)).is_recoverable());
        assert!(ScanError::NetworkTest("status 503".into()).is_recoverable());
    }

    #[test]
    fn fatal_errors_are_not() {
        assert!(!ScanError::NoCandidates("hosts.txt".into()).is_recoverable());
        assert!(!ScanError::Cancelled.is_recoverable());
        assert!(!ScanError::SearchConfigIntegrity(0.5).is_recoverable());
    }
}
