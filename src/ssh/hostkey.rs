//! Known host keys of a target and the public-key encodings the account
//! service works with

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

/// Base64 of the SSH wire encoding of `key`, as stored by the account service
pub fn wire_base64(key: &PublicKey) -> Result<String> {
    let bytes = key
        .to_bytes()
        .map_err(|e| Error::InvalidMessage(format!("cannot encode public key: {}", e)))?;
    Ok(STANDARD.encode(bytes))
}

/// Host keys accepted for one target
#[derive(Debug, Clone, Default)]
pub struct KnownHostKeys {
    keys: Vec<PublicKey>,
}

impl KnownHostKeys {
    /// Parse authorized-keys formatted lines
    ///
    /// Parsing stops at the first line that is not a key, so a trailing
    /// comment block or garbage leaves the keys above it intact.
    pub fn parse(text: &str) -> Self {
        let mut keys = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match PublicKey::from_openssh(line) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    debug!(error = %e, "host key list ends");
                    break;
                }
            }
        }
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Accept `presented` only when it equals one of the known keys
    ///
    /// An empty list matches nothing.
    pub fn verify(&self, host: &str, presented: &PublicKey) -> Result<()> {
        if self
            .keys
            .iter()
            .any(|known| known.key_data() == presented.key_data())
        {
            info!(host, algorithm = %presented.algorithm(), "host key match");
            return Ok(());
        }
        warn!(host, algorithm = %presented.algorithm(), known = self.keys.len(), "host key not match");
        Err(Error::HostKeyMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIEfJcHLmXgGlf/sgMAwTDqLbhOU8DWKUqmB2wVxL3EqR web1";
    const ED25519_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAINaZYlYKA//CKQ3z/jxYLTlrtqkLENOuUe4s865WBXhu";

    fn key(line: &str) -> PublicKey {
        PublicKey::from_openssh(line).unwrap()
    }

    #[test]
    fn test_parse_multiple_lines() {
        let known = KnownHostKeys::parse(&format!("{}\n\n{}\n", ED25519_A, ED25519_B));
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn test_parse_stops_at_garbage() {
        let known = KnownHostKeys::parse(&format!("{}\nnot a key\n{}", ED25519_A, ED25519_B));
        assert_eq!(known.len(), 1);
    }

    #[test]
    fn test_verify_matching_key_ignores_comment() {
        let known = KnownHostKeys::parse(ED25519_A);
        let presented = key(ED25519_A.trim_end_matches(" web1"));
        assert!(known.verify("web1", &presented).is_ok());
    }

    #[test]
    fn test_verify_mismatch_fails_closed() {
        let known = KnownHostKeys::parse(ED25519_A);
        assert!(matches!(
            known.verify("web1", &key(ED25519_B)),
            Err(Error::HostKeyMismatch)
        ));
        assert!(matches!(
            KnownHostKeys::default().verify("web1", &key(ED25519_A)),
            Err(Error::HostKeyMismatch)
        ));
    }

    #[test]
    fn test_wire_base64_matches_openssh_field() {
        let encoded = wire_base64(&key(ED25519_A)).unwrap();
        assert_eq!(Some(encoded.as_str()), ED25519_A.split_whitespace().nth(1));
    }
}
