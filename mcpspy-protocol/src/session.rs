//! Session identity: protocol-provided ids (the `Mcp-Session-Id` header)
//! with generated internal ids as fallback.

use std::fmt::Display;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A unique MCP communication session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session id carried by the protocol, if any.
    pub external_id: Option<String>,
    /// Generated id derived from transport characteristics.
    pub internal_id: String,
}

impl Session {
    /// Session with a protocol-provided id plus a generated internal id.
    pub fn from_protocol(external_id: impl Into<String>, internal_id: impl Into<String>) -> Self {
        Session {
            external_id: Some(external_id.into()),
            internal_id: internal_id.into(),
        }
    }

    /// Session identified only by a generated id.
    pub fn from_heuristic(internal_id: impl Into<String>) -> Self {
        Session {
            external_id: None,
            internal_id: internal_id.into(),
        }
    }

    /// The primary identifier: the external id when present, the
    /// internal id otherwise.
    pub fn id(&self) -> &str {
        match self.external_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => &self.internal_id,
        }
    }
}

/// A fresh random session id.
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// A deterministic session id from transport characteristics: identical
/// component tuples always yield the same id. The SHA-256 of the joined
/// components is formatted as a UUIDv4-shaped string.
pub fn deterministic_id(components: &[&dyn Display]) -> String {
    let mut composite = String::new();
    for c in components {
        composite.push_str(&format!("{}:", c));
    }

    let hash = hex::encode(Sha256::digest(composite.as_bytes()));

    format!(
        "{}-{}-4{}-{}-{}",
        &hash[0..8],
        &hash[8..12],
        &hash[13..16],
        &hash[16..20],
        &hash[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_id_takes_precedence() {
        let s = Session::from_protocol("external-123", "internal-456");
        assert_eq!(s.id(), "external-123");
    }

    #[test]
    fn internal_id_without_external() {
        let s = Session::from_heuristic("internal-456");
        assert_eq!(s.id(), "internal-456");
    }

    #[test]
    fn empty_external_id_falls_back() {
        let s = Session::from_protocol("", "internal-789");
        assert_eq!(s.id(), "internal-789");
    }

    #[test]
    fn generate_uuid_is_unique_and_shaped() {
        let a = generate_uuid();
        let b = generate_uuid();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
    }

    #[test]
    fn deterministic_id_is_stable() {
        let a = deterministic_id(&[&"stdio", &100u32, &200u32]);
        let b = deterministic_id(&[&"stdio", &100u32, &200u32]);
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_id_differs_on_components() {
        let a = deterministic_id(&[&"stdio", &100u32, &200u32]);
        let b = deterministic_id(&[&"stdio", &100u32, &201u32]);
        assert_ne!(a, b);
    }

    #[test]
    fn deterministic_id_is_uuid_shaped() {
        let id = deterministic_id(&[&"http", &0xdeadbeefu64]);
        assert_eq!(id.len(), 36);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 4);
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].starts_with('4'));
        assert_eq!(parts[3].len(), 4);
        assert_eq!(parts[4].len(), 12);
    }
}
