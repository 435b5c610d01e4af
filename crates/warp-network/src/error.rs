//! Client errors and how callers should react to them.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("no usable peers")] NoPeers,
    #[error("invalid peer url {0:?}")] InvalidUrl(String),
    #[error("transport error from {peer}: {reason}")] Transport { peer: String, reason: String },
    #[error("request to {peer} timed out")] Timeout { peer: String },
    #[error("{peer} rate limited the request")] RateLimited { peer: String },
    #[error("{peer} returned status {status}")] Status { peer: String, status: u16 },
    #[error("malformed response from {peer}: {reason}")] Decode { peer: String, reason: String },
    #[error("http client setup failed: {0}")] Setup(String),
    #[error("cancelled")] Cancelled,
}

/// Coarse reaction class of a [`ClientError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Transient: timeouts, resets, 5xx, garbage bodies.
    Retryable,
    /// 429. The host was slowed down; the caller's own loop decides when to come back.
    RateLimited,
    /// 404. The resource may appear later.
    NotFound,
    /// Any other 4xx or a bad request on our side.
    Terminal,
    Cancelled,
}

impl ClientError {
    pub fn classify(&self) -> Classification {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::Decode { .. } | Self::NoPeers => {
                Classification::Retryable
            }
            Self::RateLimited { .. } => Classification::RateLimited,
            Self::Status { status: 404, .. } => Classification::NotFound,
            Self::Status { status, .. } if *status >= 500 => Classification::Retryable,
            Self::Status { .. } | Self::InvalidUrl(_) | Self::Setup(_) => Classification::Terminal,
            Self::Cancelled => Classification::Cancelled,
        }
    }

    /// Worth replaying the request against another peer.
    pub fn should_fail_over(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::InvalidUrl(_) | Self::Setup(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> ClientError {
        ClientError::Status { peer: "a.example".into(), status: code }
    }

    #[test]
    fn server_errors_retryable() {
        assert_eq!(status(500).classify(), Classification::Retryable);
        assert_eq!(status(503).classify(), Classification::Retryable);
    }

    #[test]
    fn client_errors_terminal() {
        assert_eq!(status(400).classify(), Classification::Terminal);
        assert_eq!(status(410).classify(), Classification::Terminal);
    }

    #[test]
    fn not_found_is_its_own_class() {
        assert_eq!(status(404).classify(), Classification::NotFound);
    }

    #[test]
    fn rate_limited_is_neither_retryable_nor_terminal() {
        let c = ClientError::RateLimited { peer: "a.example".into() }.classify();
        assert_eq!(c, Classification::RateLimited);
    }

    #[test]
    fn cancelled_never_fails_over() {
        assert!(!ClientError::Cancelled.should_fail_over());
        assert!(status(500).should_fail_over());
        assert!(ClientError::Timeout { peer: "b".into() }.should_fail_over());
    }
}
