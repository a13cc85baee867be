//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used across the testbed. The join token
//! minted by the control-plane server is a bearer credential: anyone holding
//! it can attach a node to the trust domain until it expires. It must never
//! reach a log line, so it is carried as a `SecretString` from the moment it
//! is parsed out of the server's output until it is written to the hand-off
//! file.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct AgentBootstrap {
//!     agent_id: String,
//!     join_token: SecretString, // Debug shows "[REDACTED]"
//! }
//!
//! let bootstrap = AgentBootstrap {
//!     agent_id: "spiffe://example.org/myagent".to_string(),
//!     join_token: SecretString::from("0b5c6e0a-token"),
//! };
//!
//! assert!(!format!("{bootstrap:?}").contains("0b5c6e0a-token"));
//!
//! // Reading the value is always an explicit, greppable call.
//! let token: &str = bootstrap.join_token.expose_secret();
//! assert_eq!(token, "0b5c6e0a-token");
//! ```

pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("3f1c9a52-join-token");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("3f1c9a52"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("token-value");
        assert_eq!(secret.expose_secret(), "token-value");
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct Bootstrap {
            agent_id: String,
            join_token: SecretString,
        }

        let bootstrap = Bootstrap {
            agent_id: "spiffe://example.org/myagent".to_string(),
            join_token: SecretString::from("super-secret"),
        };

        let debug_str = format!("{bootstrap:?}");

        assert!(debug_str.contains("spiffe://example.org/myagent"));
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("super-secret"));
    }

    #[test]
    fn test_deserialize() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Handoff {
            agent_id: String,
            join_token: SecretString,
        }

        let json = r#"{"agent_id": "spiffe://example.org/a", "join_token": "abc-123"}"#;
        let handoff: Handoff = serde_json::from_str(json).expect("deserialize");

        assert_eq!(handoff.join_token.expose_secret(), "abc-123");

        let debug = format!("{handoff:?}");
        assert!(!debug.contains("abc-123"));
        assert!(debug.contains("REDACTED"));
    }
}
