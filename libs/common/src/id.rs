use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = murmur_common::id::prefixed_ulid("conn");
/// assert!(id.starts_with("conn_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Splits a prefixed ID into its prefix and ULID parts.
///
/// Returns `None` when the separator is missing or the suffix is not a valid ULID.
pub fn split_prefixed(id: &str) -> Option<(&str, Ulid)> {
    let (prefix, raw) = id.rsplit_once('_')?;
    let ulid = Ulid::from_string(raw).ok()?;
    Some((prefix, ulid))
}

/// Well-known ID prefixes.
pub mod prefix {
    /// A single realtime connection (one WebSocket).
    pub const CONNECTION: &str = "conn";
    /// A running gateway process; used as the leader-lease owner.
    pub const INSTANCE: &str = "inst";
    pub const TICKET: &str = "wst";
    /// Server-minted idempotency key for a send that carried no `client_id`.
    pub const MESSAGE_KEY: &str = "msg";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ulid_format() {
        let id = prefixed_ulid("conn");
        assert!(id.starts_with("conn_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 5 + 26);
    }

    #[test]
    fn uniqueness() {
        let a = prefixed_ulid(prefix::CONNECTION);
        let b = prefixed_ulid(prefix::CONNECTION);
        assert_ne!(a, b);
    }

    #[test]
    fn split_prefixed_recovers_parts() {
        let id = prefixed_ulid(prefix::INSTANCE);
        let (prefix, _) = split_prefixed(&id).unwrap();
        assert_eq!(prefix, "inst");

        assert!(split_prefixed("no-separator").is_none());
        assert!(split_prefixed("conn_not-a-ulid").is_none());
    }
}
