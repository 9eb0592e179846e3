//! Identities: local naming and hierarchical address matching.
//!
//! Identities are plain strings advertised during the handshake. A dot
//! separates hierarchy levels, so a peer registered as `"server.instance-7"`
//! is also reachable as `"server"`. Identities are advisory and never
//! verified.

/// Separator between hierarchy levels of an identity.
pub const SEPARATOR: char = '.';

/// Resolve the local identity: the configured one, else the host name.
pub fn resolve_local_identity(configured: Option<&str>) -> String {
    match configured {
        Some(identity) if !identity.is_empty() => identity.to_string(),
        _ => host_name(),
    }
}

fn host_name() -> String {
    match whoami::fallible::hostname() {
        Ok(name) if !name.is_empty() => name,
        Ok(_) => "localhost".to_string(),
        Err(e) => {
            tracing::warn!("Cannot read host name, using 'localhost': {e}");
            "localhost".to_string()
        }
    }
}

/// Exact match of a peer identity against a target.
pub fn is_exact(peer: &str, target: &str) -> bool {
    !target.is_empty() && peer == target
}

/// `peer` lives below `target` in the hierarchy (`"a.b"` under `"a"`).
///
/// The separator is required: `"serverx"` is not under `"server"`.
pub fn is_descendant(peer: &str, target: &str) -> bool {
    !target.is_empty()
        && peer
            .strip_prefix(target)
            .is_some_and(|rest| rest.starts_with(SEPARATOR))
}

/// Either an exact match or a descendant.
pub fn matches(peer: &str, target: &str) -> bool {
    is_exact(peer, target) || is_descendant(peer, target)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
