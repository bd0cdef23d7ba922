use thiserror::Error;

/// Typed remote catalog errors.
///
/// `status()` exposes the HTTP status or service-level code so callers can
/// log the failing target with something more useful than a message.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP error {status} from {endpoint}: {body}")]
    HttpStatus {
        status: u16,
        endpoint: &'static str,
        body: String,
    },

    #[error("API error {code} from {endpoint}: {message}")]
    Api {
        code: i64,
        endpoint: &'static str,
        message: String,
    },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("Invalid response from {endpoint}: {source}")]
    Json {
        endpoint: &'static str,
        source: serde_json::Error,
    },

    #[error("Malformed response from {endpoint}: {reason}")]
    Malformed {
        endpoint: &'static str,
        reason: String,
    },
}

impl CatalogError {
    /// HTTP status or service error code, when the remote side supplied one.
    pub fn status(&self) -> Option<i64> {
        match self {
            CatalogError::HttpStatus { status, .. } => Some(i64::from(*status)),
            CatalogError::Api { code, .. } => Some(*code),
            CatalogError::Http(e) => e.status().map(|s| i64::from(s.as_u16())),
            CatalogError::Json { .. } | CatalogError::Malformed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_of_http_error() {
        let e = CatalogError::HttpStatus {
            status: 404,
            endpoint: "playlists",
            body: "not found".into(),
        };
        assert_eq!(e.status(), Some(404));
        assert!(e.to_string().contains("404"));
    }

    #[test]
    fn test_status_of_api_error() {
        let e = CatalogError::Api {
            code: -2,
            endpoint: "albums",
            message: "bad uin".into(),
        };
        assert_eq!(e.status(), Some(-2));
    }

    #[test]
    fn test_malformed_has_no_status() {
        let e = CatalogError::Malformed {
            endpoint: "songs",
            reason: "empty cdlist".into(),
        };
        assert_eq!(e.status(), None);
    }
}
