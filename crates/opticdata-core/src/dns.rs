//! Custom-domain DNS challenges.
//!
//! A site that wants first-party serving points an A record at the pixel
//! server and proves control of the parent zone with a TXT record at
//! `_opticdata.<registrable-parent>`. The actual lookups go through the
//! [`DnsResolver`] seam so tests never touch the network.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;

/// Label the TXT challenge is published under.
pub const CHALLENGE_LABEL: &str = "_opticdata";
/// Prefix of the TXT record value.
pub const CHALLENGE_VALUE_PREFIX: &str = "odt-verify=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("domain must contain at least one dot")]
    MissingDot,
    #[error("domain label is empty")]
    EmptyLabel,
    #[error("domain label exceeds 63 characters: {0}")]
    LabelTooLong(String),
    #[error("domain contains invalid characters: {0}")]
    InvalidCharacters(String),
}

/// Validate an ASCII hostname: dot-separated labels of `[A-Za-z0-9-]`,
/// 1–63 chars each, no leading/trailing hyphen, at least one dot.
pub fn validate_domain(domain: &str) -> Result<(), DomainError> {
    let domain = domain.trim().trim_end_matches('.');
    if !domain.contains('.') {
        return Err(DomainError::MissingDot);
    }
    for label in domain.split('.') {
        if label.is_empty() {
            return Err(DomainError::EmptyLabel);
        }
        if label.len() > 63 {
            return Err(DomainError::LabelTooLong(label.to_string()));
        }
        let valid = label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(DomainError::InvalidCharacters(label.to_string()));
        }
    }
    Ok(())
}

/// The domain minus its leftmost label when it has ≥3 labels, else the
/// domain itself. `track.shop.example` → `shop.example`;
/// `example.com` → `example.com`.
pub fn registrable_parent(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('.');
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() >= 3 {
        labels[1..].join(".")
    } else {
        domain.to_string()
    }
}

/// Host the TXT challenge record lives at.
pub fn challenge_host(domain: &str) -> String {
    format!("{}.{}", CHALLENGE_LABEL, registrable_parent(domain))
}

/// 32 bytes of cryptographic random, hex-encoded (64 chars).
pub fn generate_challenge_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The two records the site owner must publish.
#[derive(Debug, Clone, Serialize)]
pub struct DnsChallenge {
    pub a_host: String,
    pub a_value: String,
    pub txt_host: String,
    pub txt_value: String,
}

/// Build the challenge record set for `domain` pointing at `pixel_ip`.
pub fn challenge_records(domain: &str, pixel_ip: &str, token: &str) -> DnsChallenge {
    DnsChallenge {
        a_host: domain.trim().trim_end_matches('.').to_string(),
        a_value: pixel_ip.to_string(),
        txt_host: challenge_host(domain),
        txt_value: format!("{}{}", CHALLENGE_VALUE_PREFIX, token),
    }
}

#[derive(Debug, Error)]
#[error("dns lookup failed for {host}: {message}")]
pub struct DnsLookupError {
    pub host: String,
    pub message: String,
}

/// Async A/TXT resolution seam. The server wires in a real resolver;
/// tests use [`StaticDnsResolver`].
#[async_trait]
pub trait DnsResolver: Send + Sync + 'static {
    async fn lookup_a(&self, host: &str) -> Result<Vec<IpAddr>, DnsLookupError>;
    async fn lookup_txt(&self, host: &str) -> Result<Vec<String>, DnsLookupError>;
}

/// Fixed-answer resolver for tests. Hosts absent from the maps resolve to
/// an empty record set (NXDOMAIN-ish, not an error). Records can be
/// published after construction, mirroring a site owner editing their zone
/// between generate and verify.
#[derive(Debug, Default)]
pub struct StaticDnsResolver {
    a_records: std::sync::RwLock<HashMap<String, Vec<IpAddr>>>,
    txt_records: std::sync::RwLock<HashMap<String, Vec<String>>>,
}

impl StaticDnsResolver {
    pub fn publish_a(&self, host: &str, ip: IpAddr) {
        if let Ok(mut records) = self.a_records.write() {
            records.entry(host.to_string()).or_default().push(ip);
        }
    }

    pub fn publish_txt(&self, host: &str, value: &str) {
        if let Ok(mut records) = self.txt_records.write() {
            records
                .entry(host.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
}

#[async_trait]
impl DnsResolver for StaticDnsResolver {
    async fn lookup_a(&self, host: &str) -> Result<Vec<IpAddr>, DnsLookupError> {
        Ok(self
            .a_records
            .read()
            .map(|records| records.get(host).cloned().unwrap_or_default())
            .unwrap_or_default())
    }

    async fn lookup_txt(&self, host: &str) -> Result<Vec<String>, DnsLookupError> {
        Ok(self
            .txt_records
            .read()
            .map(|records| records.get(host).cloned().unwrap_or_default())
            .unwrap_or_default())
    }
}

/// One failed check during verification. These are returned to the caller
/// as data, never as an HTTP error — verification is safe to retry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DnsCheckFailure {
    DnsLookupFailed { host: String, message: String },
    RecordMismatch { host: String, expected: String, found: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsVerification {
    pub verified: bool,
    pub errors: Vec<DnsCheckFailure>,
}

/// Check both challenge records. The A lookup must contain `pixel_ip`; one
/// TXT record at the challenge host must equal the expected value exactly.
/// Lookup failures and mismatches are accumulated, not short-circuited, so
/// the caller sees everything still wrong at once.
pub async fn verify_challenge(
    resolver: &dyn DnsResolver,
    domain: &str,
    pixel_ip: &str,
    token: &str,
) -> DnsVerification {
    let records = challenge_records(domain, pixel_ip, token);
    let mut errors = Vec::new();

    match resolver.lookup_a(&records.a_host).await {
        Ok(ips) => {
            let found: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
            if !found.iter().any(|ip| ip == &records.a_value) {
                errors.push(DnsCheckFailure::RecordMismatch {
                    host: records.a_host.clone(),
                    expected: records.a_value.clone(),
                    found,
                });
            }
        }
        Err(e) => errors.push(DnsCheckFailure::DnsLookupFailed {
            host: e.host,
            message: e.message,
        }),
    }

    match resolver.lookup_txt(&records.txt_host).await {
        Ok(values) => {
            if !values.iter().any(|v| v == &records.txt_value) {
                errors.push(DnsCheckFailure::RecordMismatch {
                    host: records.txt_host.clone(),
                    expected: records.txt_value.clone(),
                    found: values,
                });
            }
        }
        Err(e) => errors.push(DnsCheckFailure::DnsLookupFailed {
            host: e.host,
            message: e.message,
        }),
    }

    DnsVerification {
        verified: errors.is_empty(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_plain_domains() {
        assert!(validate_domain("track.example.com").is_ok());
        assert!(validate_domain("example.com").is_ok());
        assert_eq!(validate_domain("localhost"), Err(DomainError::MissingDot));
        assert_eq!(
            validate_domain("bad_label.example.com"),
            Err(DomainError::InvalidCharacters("bad_label".to_string()))
        );
        assert_eq!(validate_domain("a..com"), Err(DomainError::EmptyLabel));
        let long = format!("{}.example.com", "x".repeat(64));
        assert!(matches!(
            validate_domain(&long),
            Err(DomainError::LabelTooLong(_))
        ));
    }

    #[test]
    fn registrable_parent_strips_leftmost_label_at_three_labels() {
        assert_eq!(registrable_parent("track.shop.example"), "shop.example");
        assert_eq!(registrable_parent("example.com"), "example.com");
        assert_eq!(
            registrable_parent("a.b.c.example.com"),
            "b.c.example.com"
        );
    }

    #[test]
    fn challenge_host_uses_parent_zone() {
        assert_eq!(
            challenge_host("track.example.com"),
            "_opticdata.example.com"
        );
        assert_eq!(challenge_host("example.com"), "_opticdata.example.com");
    }

    #[test]
    fn challenge_token_is_64_hex_chars() {
        let token = generate_challenge_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_challenge_token());
    }

    #[tokio::test]
    async fn verify_passes_when_both_records_match() {
        let token = "ab".repeat(32);
        let resolver = StaticDnsResolver::default();
        resolver.publish_a("track.example.com", "203.0.113.9".parse().expect("ip"));
        resolver.publish_txt(
            "_opticdata.example.com",
            &format!("odt-verify={token}"),
        );

        let outcome = verify_challenge(&resolver, "track.example.com", "203.0.113.9", &token).await;
        assert!(outcome.verified);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn verify_reports_both_failures_at_once() {
        let token = "cd".repeat(32);
        let resolver = StaticDnsResolver::default();
        let outcome = verify_challenge(&resolver, "track.example.com", "203.0.113.9", &token).await;
        assert!(!outcome.verified);
        assert_eq!(outcome.errors.len(), 2);
    }

    #[tokio::test]
    async fn verify_rejects_wrong_txt_value() {
        let token = "ef".repeat(32);
        let resolver = StaticDnsResolver::default();
        resolver.publish_a("track.example.com", "203.0.113.9".parse().expect("ip"));
        resolver.publish_txt("_opticdata.example.com", "odt-verify=stale-token");

        let outcome = verify_challenge(&resolver, "track.example.com", "203.0.113.9", &token).await;
        assert!(!outcome.verified);
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(
            outcome.errors[0],
            DnsCheckFailure::RecordMismatch { .. }
        ));
    }
}
