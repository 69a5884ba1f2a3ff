//! Error model for hub operations.
//!
//! Callers need to tell apart "fix your network/trust store", "log in again",
//! and "the hub rejected this request". Everything the client surfaces maps
//! to exactly one of those, plus integrity and local configuration failures.

use std::error::Error as StdError;

use polaris_config::settings::ENV_CA_BUNDLE;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Identity or hub token missing, expired, or rejected (including any HTTP 401)
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// TLS trust failure while connecting
    #[error("{0}")]
    Certificate(String),

    /// Non-success response carrying a structured error body from the hub
    #[error("the request to the hub failed ({status}). Server response:\n{}", pretty_payload(.payload))]
    HubRequest { status: u16, payload: serde_json::Value },

    /// Raw status error passed through without interpretation (always used for HTTP 500)
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    Integrity { expected: String, actual: String },

    /// Invalid option combination, detected before any network call
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bulk copy hit an existing destination key under the `raise` policy
    #[error("destination already contains '{key}' (conflict policy: raise)")]
    Conflict { key: String },

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("array store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// True for failures the caller can fix by logging in again.
    pub fn is_authentication(&self) -> bool {
        matches!(self, HubError::Authentication(_))
    }

    /// Translate a transport-level failure, singling out certificate verification.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if is_certificate_failure(&err) {
            return HubError::Certificate(format!(
                "Could not verify the hub's TLS certificate ({}). Make sure your system trust store \
                 is up to date. To use a custom CA bundle, set {} to the bundle's path. For debugging \
                 only, verification can be disabled by setting {}=false.",
                error_chain(&err),
                ENV_CA_BUNDLE,
                ENV_CA_BUNDLE,
            ));
        }
        if err.is_timeout() {
            return HubError::Network(format!("request timed out: {}", error_chain(&err)));
        }
        HubError::Network(error_chain(&err))
    }
}

fn pretty_payload(payload: &serde_json::Value) -> String {
    // serde_json's default map is ordered, so keys come out sorted
    serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
}

fn is_certificate_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let msg = e.to_string().to_ascii_lowercase();
        if msg.contains("certificate") || msg.contains("unknownissuer") {
            return true;
        }
        current = e.source();
    }
    false
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let msg = e.to_string();
        if !parts.iter().any(|p| p.contains(&msg)) {
            parts.push(msg);
        }
        current = e.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Leaf(&'static str);

    impl std::fmt::Display for Leaf {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl StdError for Leaf {}

    #[derive(Debug)]
    struct Wrapper(Leaf);

    impl std::fmt::Display for Wrapper {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("error sending request")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_certificate_detection_walks_source_chain() {
        let err = Wrapper(Leaf("invalid peer certificate: UnknownIssuer"));
        assert!(is_certificate_failure(&err));

        let err = Wrapper(Leaf("connection refused"));
        assert!(!is_certificate_failure(&err));
    }

    #[test]
    fn test_error_chain_joins_sources() {
        let err = Wrapper(Leaf("connection refused"));
        assert_eq!(error_chain(&err), "error sending request: connection refused");
    }

    #[test]
    fn test_hub_request_display_is_sorted_json() {
        let err = HubError::HubRequest {
            status: 422,
            payload: serde_json::json!({"zeta": 1, "alpha": {"detail": "bad name"}}),
        };
        let msg = err.to_string();
        assert!(msg.contains("(422)"));
        let alpha = msg.find("\"alpha\"").unwrap();
        let zeta = msg.find("\"zeta\"").unwrap();
        assert!(alpha < zeta, "keys should be sorted: {}", msg);
        assert!(msg.contains("bad name"));
    }

    #[test]
    fn test_is_authentication() {
        assert!(HubError::Authentication("expired".into()).is_authentication());
        assert!(!HubError::Status { status: 500, body: String::new() }.is_authentication());
    }
}
