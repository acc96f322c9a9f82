use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::base58;

/// DNS label suffix for verification records.
const VERIFICATION_SUFFIX: &str = "-zeitwork";

/// The DNS name a domain owner must create a TXT record at:
/// `<base58(domain id)>-zeitwork.<domain name>`.
pub fn verification_record_name(domain_id: &Uuid, domain_name: &str) -> String {
    format!(
        "{}{}.{}",
        base58::encode_id(domain_id),
        VERIFICATION_SUFFIX,
        domain_name
    )
}

/// Deterministic per-domain verification token.
///
/// Derived from the domain id and a platform-wide secret so the token can
/// be recomputed by any control-plane replica without coordination.
pub fn verification_token(domain_id: &Uuid, platform_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain_id.as_bytes());
    hasher.update(platform_secret.as_bytes());
    let digest = hasher.finalize();
    let n = u128::from_be_bytes(digest[..16].try_into().expect("digest is 32 bytes"));
    format!("zeitwork-verify={}", base58::encode(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_name_shape() {
        let id = Uuid::from_u128(42);
        let name = verification_record_name(&id, "example.com");
        assert!(name.ends_with("-zeitwork.example.com"));
        assert!(!name.starts_with('.'));
    }

    #[test]
    fn test_token_is_deterministic() {
        let id = crate::ids::new_id();
        let a = verification_token(&id, "secret");
        let b = verification_token(&id, "secret");
        assert_eq!(a, b);
    }

    #[test]
    fn test_token_depends_on_domain_and_secret() {
        let a = verification_token(&crate::ids::new_id(), "secret");
        let b = verification_token(&crate::ids::new_id(), "secret");
        assert_ne!(a, b);

        let id = crate::ids::new_id();
        assert_ne!(
            verification_token(&id, "secret-one"),
            verification_token(&id, "secret-two")
        );
    }

    #[test]
    fn test_token_prefix() {
        let token = verification_token(&crate::ids::new_id(), "s");
        assert!(token.starts_with("zeitwork-verify="));
    }
}
