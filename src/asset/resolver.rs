//! Turns a configured artifact URL into the ordered list of URLs worth trying.
//!
//! Plain URLs pass through untouched. Google Drive share links are rewritten
//! into direct-download endpoints, because the share page itself is HTML and
//! large files sit behind a "can't scan for viruses" confirmation page.

use once_cell::sync::Lazy;
use regex::Regex;

const DRIVE_HOSTS: [&str; 2] = ["drive.google.com", "docs.google.com"];

/// Direct-download endpoints, most likely to skip the confirmation page first.
const DRIVE_VARIANTS: [&str; 3] = [
    "https://drive.google.com/uc?export=download&id={id}",
    "https://drive.google.com/uc?id={id}&export=download",
    "https://drive.usercontent.google.com/download?id={id}&export=download",
];

// First match wins.
static DRIVE_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"/d/([a-zA-Z0-9_-]+)", r"[?&]id=([a-zA-Z0-9_-]+)"]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
});

static DRIVE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"confirm=([A-Za-z0-9_-]+)").expect("static pattern"));

pub static DRIVE_CONFIRM: ConfirmRule = ConfirmRule {
    param: "confirm",
    markers: &["virus scan warning"],
    token: &DRIVE_TOKEN,
};

/// How to recognise a provider's confirmation interstitial and get past it.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmRule {
    /// Query parameter carrying the token, e.g. `confirm`.
    pub param: &'static str,
    /// Lowercase phrases that only appear on the interstitial page.
    pub markers: &'static [&'static str],
    /// Captures the token value in group 1.
    pub token: &'static Lazy<Regex>,
}

impl PartialEq for ConfirmRule {
    fn eq(&self, other: &Self) -> bool {
        self.param == other.param
            && self.markers == other.markers
            && self.token.as_str() == other.token.as_str()
    }
}

impl Eq for ConfirmRule {}

impl ConfirmRule {
    /// `head` is a prefix of the response body, not the whole body.
    pub fn is_interstitial(&self, final_url: &str, head: &[u8]) -> bool {
        if final_url.contains(&format!("{}=", self.param)) {
            return true;
        }
        let text = String::from_utf8_lossy(head).to_lowercase();
        self.markers.iter().any(|marker| text.contains(marker))
    }

    pub fn extract_token(&self, body: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(body);
        self.token.captures(&text).map(|caps| caps[1].to_string())
    }

    pub fn follow_up_url(&self, url: &str, token: &str) -> String {
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{}{}{}={}", url, separator, self.param, token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadCandidate {
    pub url: String,
    pub confirm: Option<ConfirmRule>,
}

impl DownloadCandidate {
    pub fn plain(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            confirm: None,
        }
    }

    pub fn gated(url: impl Into<String>, rule: ConfirmRule) -> Self {
        Self {
            url: url.into(),
            confirm: Some(rule),
        }
    }
}

pub fn resolve(url: &str) -> Vec<DownloadCandidate> {
    let Some(file_id) = drive_file_id(url) else {
        return vec![DownloadCandidate::plain(url)];
    };

    let mut candidates: Vec<DownloadCandidate> = DRIVE_VARIANTS
        .iter()
        .map(|template| DownloadCandidate::gated(template.replace("{id}", &file_id), DRIVE_CONFIRM))
        .collect();

    // The configured link itself is the last resort.
    if candidates.iter().all(|c| c.url != url) {
        candidates.push(DownloadCandidate::gated(url, DRIVE_CONFIRM));
    }

    candidates
}

fn drive_file_id(url: &str) -> Option<String> {
    if !DRIVE_HOSTS.iter().any(|host| url.contains(host)) {
        return None;
    }

    DRIVE_ID_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(url))
        .map(|caps| caps[1].to_string())
}
