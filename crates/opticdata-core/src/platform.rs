//! Touchpoint platform derivation.
//!
//! Click identifiers win over utm_source; utm_source substrings map to the
//! big ad platforms; anything else tagged falls back to `referral`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Meta,
    Google,
    Tiktok,
    Snapchat,
    Bing,
    Newsbreak,
    Referral,
    Direct,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::Google => "google",
            Self::Tiktok => "tiktok",
            Self::Snapchat => "snapchat",
            Self::Bing => "bing",
            Self::Newsbreak => "newsbreak",
            Self::Referral => "referral",
            Self::Direct => "direct",
        }
    }
}

/// Click identifiers captured from the landing URL.
#[derive(Debug, Clone, Default)]
pub struct ClickIds {
    pub fbclid: Option<String>,
    pub gclid: Option<String>,
    pub ttclid: Option<String>,
    pub sclid: Option<String>,
    pub msclkid: Option<String>,
}

impl ClickIds {
    pub fn is_empty(&self) -> bool {
        self.fbclid.is_none()
            && self.gclid.is_none()
            && self.ttclid.is_none()
            && self.sclid.is_none()
            && self.msclkid.is_none()
    }

    /// The click id that determines the platform, if any.
    pub fn primary(&self) -> Option<&str> {
        self.fbclid
            .as_deref()
            .or(self.gclid.as_deref())
            .or(self.ttclid.as_deref())
            .or(self.sclid.as_deref())
            .or(self.msclkid.as_deref())
    }
}

fn has(v: &Option<String>) -> bool {
    v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
}

/// Derive the platform for a tagged arrival. Returns `None` when neither a
/// click id nor utm_source/utm_campaign/utm_medium is present — such hits
/// are direct/organic and never become touchpoints.
pub fn derive_platform(
    clicks: &ClickIds,
    utm_source: Option<&str>,
    utm_medium: Option<&str>,
    utm_campaign: Option<&str>,
) -> Option<Platform> {
    if has(&clicks.fbclid) {
        return Some(Platform::Meta);
    }
    if has(&clicks.gclid) {
        return Some(Platform::Google);
    }
    if has(&clicks.ttclid) {
        return Some(Platform::Tiktok);
    }
    if has(&clicks.sclid) {
        return Some(Platform::Snapchat);
    }
    if has(&clicks.msclkid) {
        return Some(Platform::Bing);
    }

    let source = utm_source.map(str::trim).filter(|s| !s.is_empty());
    if let Some(source) = source {
        let source = source.to_ascii_lowercase();
        let platform = if source.contains("facebook")
            || source.contains("fb")
            || source.contains("meta")
            || source.contains("ig")
        {
            Platform::Meta
        } else if source.contains("google") {
            Platform::Google
        } else if source.contains("tiktok") {
            Platform::Tiktok
        } else if source.contains("snap") {
            Platform::Snapchat
        } else if source.contains("bing") || source.contains("microsoft") {
            Platform::Bing
        } else if source.contains("newsbreak") {
            Platform::Newsbreak
        } else {
            Platform::Referral
        };
        return Some(platform);
    }

    let campaign = utm_campaign.map(str::trim).filter(|s| !s.is_empty());
    let medium = utm_medium.map(str::trim).filter(|s| !s.is_empty());
    if campaign.is_some() || medium.is_some() {
        return Some(Platform::Referral);
    }

    None
}
