use std::io::ErrorKind;
use std::time::Duration;

use thiserror::Error;

/// Errors a delivery channel can report.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// The only two things the engine needs to know about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Worth trying again. `retry_after` carries a provider hint, if any.
    Retryable { retry_after: Option<Duration> },
    /// Will fail the same way every time; stop now.
    Permanent,
}

impl Classification {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Classification::Permanent)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Classification::Retryable { retry_after } => *retry_after,
            Classification::Permanent => None,
        }
    }
}

impl ChannelError {
    /// Default classification.
    ///
    /// - timeouts, transport errors, 408, 5xx and rate limits are retryable
    /// - auth failures, bad configuration and every other 4xx are permanent
    pub fn classify(&self) -> Classification {
        match self {
            ChannelError::Timeout(_) | ChannelError::Transport(_) => {
                Classification::Retryable { retry_after: None }
            }
            ChannelError::RateLimited { retry_after } => Classification::Retryable {
                retry_after: *retry_after,
            },
            ChannelError::Http { status, .. } => {
                if *status == 408 || *status >= 500 {
                    Classification::Retryable { retry_after: None }
                } else {
                    Classification::Permanent
                }
            }
            ChannelError::Unauthorized(_)
            | ChannelError::InvalidConfig(_)
            | ChannelError::Serialization(_) => Classification::Permanent,
            ChannelError::Io(e) => match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
                    Classification::Permanent
                }
                _ => Classification::Retryable { retry_after: None },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        let retryable = [500, 502, 503, 504, 408];
        for status in retryable {
            let err = ChannelError::Http {
                status,
                body: String::new(),
            };
            assert!(!err.classify().is_permanent(), "{} should be retryable", status);
        }

        let permanent = [400, 404, 410, 422];
        for status in permanent {
            let err = ChannelError::Http {
                status,
                body: String::new(),
            };
            assert!(err.classify().is_permanent(), "{} should be permanent", status);
        }
    }

    #[test]
    fn test_rate_limit_carries_hint() {
        let err = ChannelError::RateLimited {
            retry_after: Some(Duration::from_secs(90)),
        };
        assert_eq!(
            err.classify(),
            Classification::Retryable {
                retry_after: Some(Duration::from_secs(90))
            }
        );
    }

    #[test]
    fn test_auth_and_config_are_permanent() {
        assert!(
            ChannelError::Unauthorized("bad token".into())
                .classify()
                .is_permanent()
        );
        assert!(
            ChannelError::InvalidConfig("no url".into())
                .classify()
                .is_permanent()
        );
    }

    #[test]
    fn test_io_classification() {
        let missing = ChannelError::Io(std::io::Error::from(ErrorKind::NotFound));
        assert!(missing.classify().is_permanent());

        let denied = ChannelError::Io(std::io::Error::from(ErrorKind::PermissionDenied));
        assert!(denied.classify().is_permanent());

        let interrupted = ChannelError::Io(std::io::Error::from(ErrorKind::Interrupted));
        assert!(!interrupted.classify().is_permanent());
    }

    #[test]
    fn test_timeout_is_retryable_without_hint() {
        let c = ChannelError::Timeout(Duration::from_secs(10)).classify();
        assert!(!c.is_permanent());
        assert_eq!(c.retry_after(), None);
    }
}
