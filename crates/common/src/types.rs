//! SPIFFE identity types shared by the testbed crates.
//!
//! Parsing and validation follow the SPIFFE ID rules as implemented by the
//! [`spiffe`] crate; this module only adds the constructors the testbed needs.

pub use spiffe::{SpiffeId, SpiffeIdError, TrustDomain};

/// The ID `spiffe://<trust_domain><path>`, where `path` is absolute
/// (`/testservice`) or empty for the trust domain's own ID.
///
/// # Errors
///
/// Returns [`SpiffeIdError`] if `path` is not a valid SPIFFE ID path.
pub fn id_in(trust_domain: &TrustDomain, path: &str) -> Result<SpiffeId, SpiffeIdError> {
    SpiffeId::new(&format!("spiffe://{trust_domain}{path}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_id_in_trust_domain() {
        let td = TrustDomain::new("example.org").unwrap();
        let id = id_in(&td, "/myagent").unwrap();

        assert_eq!(id.to_string(), "spiffe://example.org/myagent");
        assert_eq!(id.trust_domain(), &td);
        assert_eq!(id.path(), "/myagent");
    }

    #[test]
    fn test_id_in_rejects_malformed_paths() {
        let td = TrustDomain::new("example.org").unwrap();

        assert!(id_in(&td, "/a//b").is_err());
        assert!(id_in(&td, "/a/").is_err());
        assert!(id_in(&td, "/../x").is_err());
        assert!(id_in(&td, "/a?b").is_err());
    }

    #[test]
    fn test_trust_domain_rejects_uppercase() {
        assert!(TrustDomain::new("Example.org").is_err());
        assert!(SpiffeId::new("spiffe://Example.org/x").is_err());
        assert!(SpiffeId::new("https://example.org/x").is_err());
    }
}
