//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract: scripts rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain     | Description                              |
//! |---------|------------|------------------------------------------|
//! | 0       | Universal  | Success                                  |
//! | 1       | Universal  | General error (unspecified)              |
//! | 2       | Universal  | CLI usage error (bad args, bad settings) |
//! | 40-49   | hub        | Polaris Hub transfer codes               |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Map it in [`hub_exit_code`]

use polaris_hub_client::HubError;

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure, including local I/O and invalid artifacts.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, unreadable or invalid settings.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Hub (40-49)
// =============================================================================

/// Not authenticated, token expired, or the hub answered 401.
pub const EXIT_HUB_NOT_AUTH: u8 = 40;

/// TLS trust failure. Usually fixed with `POLARIS_CA_BUNDLE`.
pub const EXIT_HUB_CERTIFICATE: u8 = 41;

/// The hub rejected the request with a structured error body.
pub const EXIT_HUB_REJECTED: u8 = 42;

/// Checksum mismatch between downloaded content and its recorded digest.
pub const EXIT_HUB_INTEGRITY: u8 = 43;

/// Network failure, raw HTTP status error, or unexpected response shape.
pub const EXIT_HUB_NETWORK: u8 = 44;

/// A destination key already exists and `--if-exists raise` was given.
pub const EXIT_HUB_CONFLICT: u8 = 45;

/// Map a hub client error to its exit code.
pub fn hub_exit_code(err: &HubError) -> u8 {
    match err {
        HubError::Authentication(_) => EXIT_HUB_NOT_AUTH,
        HubError::Certificate(_) => EXIT_HUB_CERTIFICATE,
        HubError::HubRequest { .. } => EXIT_HUB_REJECTED,
        HubError::Integrity { .. } => EXIT_HUB_INTEGRITY,
        HubError::Status { .. } | HubError::Network(_) | HubError::Parse(_) => EXIT_HUB_NETWORK,
        HubError::Conflict { .. } => EXIT_HUB_CONFLICT,
        HubError::Configuration(_) => EXIT_USAGE,
        HubError::InvalidArtifact(_) | HubError::Store(_) | HubError::Io(_) => EXIT_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_codes_are_distinct() {
        let codes = [
            EXIT_HUB_NOT_AUTH,
            EXIT_HUB_CERTIFICATE,
            EXIT_HUB_REJECTED,
            EXIT_HUB_INTEGRITY,
            EXIT_HUB_NETWORK,
            EXIT_HUB_CONFLICT,
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!((40..50).contains(a));
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_status_errors_are_network_codes() {
        let err = HubError::Status { status: 500, body: "boom".into() };
        assert_eq!(hub_exit_code(&err), EXIT_HUB_NETWORK);

        let err = HubError::HubRequest {
            status: 404,
            payload: serde_json::json!({"message": "not found"}),
        };
        assert_eq!(hub_exit_code(&err), EXIT_HUB_REJECTED);
    }

    #[test]
    fn test_configuration_is_usage() {
        let err = HubError::Configuration("consolidated write".into());
        assert_eq!(hub_exit_code(&err), EXIT_USAGE);
        assert_eq!(hub_exit_code(&HubError::Conflict { key: "a/0".into() }), EXIT_HUB_CONFLICT);
    }
}
