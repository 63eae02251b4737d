// SDK error kinds. Evaluation and track never surface these to the caller;
// they degrade to CONTROL and a log line instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    /// Non-2xx response from the backend.
    #[error("http {status} on {endpoint}")]
    Http { endpoint: &'static str, status: u16 },

    /// Connection/timeout level failure before a status code was obtained.
    #[error("transport error on {endpoint}: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// Response body that did not parse as the expected payload.
    #[error("malformed response on {endpoint}: {source}")]
    Malformed {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Streaming auth token missing/invalid, or push disabled for the key.
    #[error("streaming auth rejected: {0}")]
    AuthRejected(String),

    #[error("sdk factory has been destroyed")]
    Destroyed,

    #[error("operation mode `{0}` is not supported by this build")]
    UnsupportedOperationMode(String),

    /// Setup failure before any network traffic (bad key format, client
    /// construction).
    #[error("sdk initialization failed: {0}")]
    Setup(String),
}

impl SdkError {
    /// 408/429 and every 5xx are worth retrying; any other 4xx is permanent
    /// and stops the affected pipeline.
    pub fn is_retryable(&self) -> bool {
        match self {
            SdkError::Http { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            SdkError::Transport { .. } => true,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SdkError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SdkError::Http { endpoint: "split", status: 408 }.is_retryable());
        assert!(SdkError::Http { endpoint: "split", status: 429 }.is_retryable());
        assert!(SdkError::Http { endpoint: "split", status: 500 }.is_retryable());
        assert!(!SdkError::Http { endpoint: "split", status: 401 }.is_retryable());
        assert!(!SdkError::Http { endpoint: "split", status: 404 }.is_retryable());
    }
}
