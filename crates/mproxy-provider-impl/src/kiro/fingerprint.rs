//! Stable per-token fingerprints for the KiroIDE-shaped User-Agent.

use sha2::{Digest, Sha256};

pub const KIRO_VERSION: &str = "0.7.45";

/// Hex fingerprint derived from the token key; stable across restarts so the
/// upstream sees one consistent client identity per credential.
pub fn fingerprint(token_key: &str) -> String {
    let digest = Sha256::digest(token_key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// `KiroIDE-<version>-<hash16>` User-Agent; without a token key, a generic
/// KiroIDE identity.
pub fn kiro_user_agent(token_key: &str) -> String {
    if token_key.is_empty() {
        return format!("KiroIDE-{KIRO_VERSION}-mproxy");
    }
    let hash = fingerprint(token_key);
    format!("KiroIDE-{KIRO_VERSION}-{}", &hash[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        assert_eq!(fingerprint("acct-1"), fingerprint("acct-1"));
        assert_ne!(fingerprint("acct-1"), fingerprint("acct-2"));
    }

    #[test]
    fn user_agent_is_kiro_ide_shaped() {
        let ua = kiro_user_agent("acct-1");
        assert!(ua.starts_with("KiroIDE-0.7.45-"));
        assert_eq!(ua.len(), "KiroIDE-0.7.45-".len() + 16);
    }
}
