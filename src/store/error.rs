use std::fmt;

/// Classified platform-API error. Tells the caller *why* a store call
/// failed so it can pick the right recovery strategy. Most callers treat
/// everything except `Auth` as transient and lean on the next pass.
#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// 401/403: bad token or missing permissions.
    Auth,
    /// 429: rate limited by the platform.
    RateLimit,
    /// 404: record or route gone.
    NotFound,
    /// Request timed out.
    Timeout,
    /// Connection refused, DNS failure, reset, etc.
    Network,
    /// 500/502/503/504: platform-side outage.
    ServerError,
    /// Anything else.
    Unknown,
}

impl StoreError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => StoreErrorKind::Auth,
            404 => StoreErrorKind::NotFound,
            408 => StoreErrorKind::Timeout,
            429 => StoreErrorKind::RateLimit,
            500 | 502 | 503 | 504 => StoreErrorKind::ServerError,
            _ => StoreErrorKind::Unknown,
        };
        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            StoreErrorKind::Timeout
        } else {
            StoreErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::RateLimit
                | StoreErrorKind::Timeout
                | StoreErrorKind::Network
                | StoreErrorKind::ServerError
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} ({}): {}", self.kind, status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for StoreError {}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 500;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(StoreError::from_status(401, "").kind, StoreErrorKind::Auth);
        assert_eq!(
            StoreError::from_status(429, "").kind,
            StoreErrorKind::RateLimit
        );
        assert_eq!(
            StoreError::from_status(503, "").kind,
            StoreErrorKind::ServerError
        );
        assert_eq!(
            StoreError::from_status(418, "").kind,
            StoreErrorKind::Unknown
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::from_status(502, "").is_transient());
        assert!(!StoreError::from_status(401, "").is_transient());
        assert!(!StoreError::from_status(404, "").is_transient());
    }

    #[test]
    fn test_truncates_long_bodies() {
        let long = "x".repeat(2000);
        let err = StoreError::from_status(500, &long);
        assert!(err.message.len() < 520);
    }
}
