use sha2::{Digest, Sha256};

/// Fallback anonymous id for noscript hits.
///
/// `/t/ping.gif` has no cookie access, so repeat hits from one browser are
/// coalesced by hashing IP + User-Agent: `ns_` + sha256(ip + ua)[0..8] as
/// 16 hex chars. The prefix keeps these ids visually distinct from the
/// UUID cookies the pixel issues.
pub fn noscript_anonymous_id(ip: &str, user_agent: &str) -> String {
    let input = format!("{}{}", ip, user_agent);
    let hash = Sha256::digest(input.as_bytes());
    format!("ns_{}", hex::encode(&hash[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noscript_id_is_prefixed_and_stable() {
        let a = noscript_anonymous_id("1.2.3.4", "Mozilla/5.0 Chrome/120");
        let b = noscript_anonymous_id("1.2.3.4", "Mozilla/5.0 Chrome/120");
        assert_eq!(a, b);
        assert!(a.starts_with("ns_"));
        assert_eq!(a.len(), 3 + 16);
    }

    #[test]
    fn noscript_id_differs_per_client() {
        let a = noscript_anonymous_id("1.2.3.4", "Mozilla/5.0 Chrome/120");
        let b = noscript_anonymous_id("5.6.7.8", "Mozilla/5.0 Chrome/120");
        assert_ne!(a, b);
    }
}
