//! Coordination-store key layout
//!
//! Records live at `/{name}/{version}/{addr}`. An empty version collapses to
//! `/{name}/{addr}`. Every key is a pure function of name, version and
//! address, so two instances differing in any of the three never collide.

use crate::{ServiceDescriptor, ServiceKey};

/// Prefix under which every instance of `key` is stored
pub fn prefix(key: &ServiceKey) -> String {
    if key.version.is_empty() {
        format!("/{}/", key.name)
    } else {
        format!("/{}/{}/", key.name, key.version)
    }
}

/// Full key of one instance record
pub fn key(desc: &ServiceDescriptor) -> String {
    format!("{}{}", prefix(&desc.key()), desc.endpoint.addr)
}

/// Address segment of a stored key
pub fn address_of(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|addr| !addr.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, version: &str, addr: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name, addr).with_version(version)
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(key(&desc("greeter", "v1", "10.0.0.1:9000")), "/greeter/v1/10.0.0.1:9000");
        assert_eq!(key(&desc("greeter", "", "10.0.0.1:9000")), "/greeter/10.0.0.1:9000");
        assert_eq!(prefix(&ServiceKey::latest("greeter")), "/greeter/latest/");
    }

    #[test]
    fn test_key_ignores_other_fields() {
        let a = desc("greeter", "v1", "10.0.0.1:9000").with_id("a").with_weight(3);
        let b = desc("greeter", "v1", "10.0.0.1:9000")
            .with_id("b")
            .with_tag("canary")
            .with_ttl(30);
        assert_eq!(key(&a), key(&b));
    }

    #[test]
    fn test_key_distinguishes_identity() {
        let base = key(&desc("greeter", "v1", "10.0.0.1:9000"));
        assert_ne!(base, key(&desc("greeter2", "v1", "10.0.0.1:9000")));
        assert_ne!(base, key(&desc("greeter", "v2", "10.0.0.1:9000")));
        assert_ne!(base, key(&desc("greeter", "v1", "10.0.0.1:9001")));
    }

    #[test]
    fn test_address_cannot_spill_into_version() {
        let nested = desc("a", "", "v1/h:1");
        let plain = desc("a", "v1", "h:1");
        assert_eq!(key(&nested), key(&plain));
        // only one of the two colliding descriptors is accepted
        assert!(plain.validate().is_ok());
        assert!(nested.validate().is_err());
    }

    #[test]
    fn test_key_stays_under_prefix() {
        let d = desc("greeter", "v1", "10.0.0.1:9000");
        assert!(key(&d).starts_with(&prefix(&d.key())));
        // a service whose name extends another's must not share its prefix
        assert!(!key(&desc("greeter-admin", "v1", "10.0.0.1:9000")).starts_with(&prefix(&d.key())));
    }

    #[test]
    fn test_address_of() {
        assert_eq!(address_of("/greeter/v1/10.0.0.1:9000"), Some("10.0.0.1:9000"));
        assert_eq!(address_of("/greeter/v1/"), None);
    }
}
