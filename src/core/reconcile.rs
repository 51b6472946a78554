use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{RejectReason, ScrapeError, ScrapeResult};
use crate::scraper::extractor::{collapse_whitespace, fields, RawCandidate};

/// How the stable product key is derived from a candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Prepended to every key, e.g. `LIDL-`
    #[serde(default)]
    pub prefix: String,
    /// Regex applied to the product URL when no SKU field is present.
    /// The first capture group (or the whole match) becomes the key.
    #[serde(default = "default_url_pattern")]
    pub url_pattern: Option<String>,
    /// Fall back to a digest of the product name
    #[serde(default)]
    pub hash_fallback: bool,
}

fn default_url_pattern() -> Option<String> {
    Some(r"(\d{6,})".to_string())
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            url_pattern: default_url_pattern(),
            hash_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSettings {
    #[serde(default)]
    pub key: KeyConfig,
    /// Case-insensitive phrases in the availability text that mark a product unavailable
    #[serde(default = "default_unavailable_markers")]
    pub unavailable_markers: Vec<String>,
}

fn default_unavailable_markers() -> Vec<String> {
    ["out of stock", "sold out", "unavailable", "ausverkauft", "nicht verfügbar"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            key: KeyConfig::default(),
            unavailable_markers: default_unavailable_markers(),
        }
    }
}

/// Normalized field values for one accepted product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDelta {
    pub key: String,
    pub name: String,
    pub price: f64,
    pub discount_percent: Option<f64>,
    pub available: bool,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub candidate: RawCandidate,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub accepted: Vec<ProductDelta>,
    pub rejected: Vec<Rejection>,
}

/// Validates, normalizes and de-duplicates raw candidates
pub struct ReconciliationEngine {
    key_prefix: String,
    url_pattern: Option<Regex>,
    hash_fallback: bool,
    unavailable_markers: Vec<String>,
}

impl ReconciliationEngine {
    pub fn new(settings: &ReconcileSettings) -> ScrapeResult<Self> {
        let url_pattern = settings
            .key
            .url_pattern
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| ScrapeError::config(format!("invalid key.url_pattern: {}", e)))?;

        Ok(Self {
            key_prefix: normalize_key(&settings.key.prefix),
            url_pattern,
            hash_fallback: settings.key.hash_fallback,
            unavailable_markers: settings
                .unavailable_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
        })
    }

    /// Reconcile one page batch. Candidates must be in page-scan order; the first
    /// occurrence of a key wins and later ones are rejected as duplicates.
    pub fn reconcile(&self, candidates: Vec<RawCandidate>) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();

        for candidate in candidates {
            match self.normalize(&candidate) {
                Ok(delta) => {
                    if seen.insert(delta.key.clone()) {
                        outcome.accepted.push(delta);
                    } else {
                        debug!("Duplicate key {} at position {}", delta.key, candidate.position);
                        outcome.rejected.push(Rejection {
                            candidate,
                            reason: RejectReason::DuplicateInBatch,
                        });
                    }
                }
                Err(reason) => {
                    debug!("Rejected candidate at position {}: {}", candidate.position, reason);
                    outcome.rejected.push(Rejection { candidate, reason });
                }
            }
        }

        outcome
    }

    /// Validate and normalize a single candidate
    pub fn normalize(&self, candidate: &RawCandidate) -> Result<ProductDelta, RejectReason> {
        let name = candidate
            .get(fields::NAME)
            .map(collapse_whitespace)
            .filter(|n| !n.is_empty())
            .ok_or(RejectReason::MissingName)?;

        let price = candidate
            .get(fields::PRICE)
            .and_then(parse_price)
            .ok_or(RejectReason::InvalidPrice)?;

        let discount_percent = match candidate.get(fields::DISCOUNT) {
            Some(text) => parse_discount(text)?,
            None => None,
        };

        let key = self.derive_key(candidate, &name).ok_or(RejectReason::MissingKey)?;

        let available = candidate
            .get(fields::AVAILABILITY)
            .map(|text| {
                let text = text.to_lowercase();
                !self.unavailable_markers.iter().any(|m| text.contains(m.as_str()))
            })
            .unwrap_or(true);

        Ok(ProductDelta {
            key,
            name,
            price,
            discount_percent,
            available,
            image_url: non_blank(candidate.get(fields::IMAGE_URL)),
            product_url: non_blank(candidate.get(fields::PRODUCT_URL)),
        })
    }

    fn derive_key(&self, candidate: &RawCandidate, name: &str) -> Option<String> {
        let from_sku = candidate.get(fields::SKU).map(normalize_key).filter(|k| !k.is_empty());

        let from_url = || {
            let pattern = self.url_pattern.as_ref()?;
            let url = candidate.get(fields::PRODUCT_URL)?;
            let captures = pattern.captures(url)?;
            let matched = captures.get(1).or_else(|| captures.get(0))?;
            Some(normalize_key(matched.as_str())).filter(|k| !k.is_empty())
        };

        let from_name = || {
            if !self.hash_fallback {
                return None;
            }
            let digest = Sha256::digest(name.to_lowercase().as_bytes());
            Some(normalize_key(&hex::encode(digest)[..12]))
        };

        let key = from_sku.or_else(from_url).or_else(from_name)?;
        if self.key_prefix.is_empty() || key.starts_with(&self.key_prefix) {
            Some(key)
        } else {
            Some(format!("{}{}", self.key_prefix, key))
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Canonical key form: upper case, only `[A-Z0-9_-]`
pub fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Parse localized price text (`12,99 €`, `€1.299,00`, `$1,299.99`, `12.-`).
/// Returns `None` for negative or unparseable values.
pub fn parse_price(text: &str) -> Option<f64> {
    let text = text.trim();
    let first_digit = text.find(|c: char| c.is_ascii_digit())?;
    let sign = &text[..first_digit];
    if sign.contains('-') || sign.contains('\u{2212}') {
        return None;
    }

    let chars: Vec<char> = text[first_digit..].chars().collect();
    let mut run = String::new();
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '0'..='9' | '.' | ',' => run.push(c),
            '\'' => {}
            ' ' | '\u{a0}' | '\u{202f}' if is_space_grouping(&run, &chars[i + 1..]) => {}
            _ => break,
        }
    }
    let run = run.trim_end_matches(['.', ',']);

    let number = match run.rfind(['.', ',']) {
        None => run.to_string(),
        Some(idx) => {
            let separator = &run[idx..idx + 1];
            let integer = &run[..idx];
            let fraction = &run[idx + 1..];
            let repeated = integer.contains(separator);
            let mixed = integer.contains(['.', ',']) && !repeated;
            let grouping = fraction.len() == 3 && integer != "0" && (repeated || !mixed);

            let integer_digits: String = integer.chars().filter(char::is_ascii_digit).collect();
            if grouping {
                format!("{}{}", integer_digits, fraction)
            } else {
                format!("{}.{}", integer_digits, fraction)
            }
        }
    };

    let value: f64 = number.parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// A space separates thousands only inside the integer part and only when
/// exactly three digits follow it. Anything else ends the number.
fn is_space_grouping(run: &str, rest: &[char]) -> bool {
    !run.is_empty()
        && !run.contains(['.', ','])
        && rest.len() >= 3
        && rest[..3].iter().all(char::is_ascii_digit)
        && rest.get(3).map_or(true, |c| !c.is_ascii_digit())
}

/// Parse discount text into a percentage in `0..=100`.
///
/// Text without digits (a promotional badge) means no discount. Numbers that
/// are neither a percentage nor a bare number are ignored.
pub fn parse_discount(text: &str) -> Result<Option<f64>, RejectReason> {
    static PERCENT: OnceLock<Option<Regex>> = OnceLock::new();
    static BARE: OnceLock<Option<Regex>> = OnceLock::new();

    if !text.chars().any(|c| c.is_ascii_digit()) {
        return Ok(None);
    }

    let percent = PERCENT
        .get_or_init(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*%").ok())
        .as_ref()
        .ok_or(RejectReason::InvalidDiscount)?;
    let bare = BARE
        .get_or_init(|| Regex::new(r"^[-\u{2212}]?\s*(\d+(?:[.,]\d+)?)$").ok())
        .as_ref()
        .ok_or(RejectReason::InvalidDiscount)?;

    let text = text.trim();
    let captured = percent
        .captures(text)
        .or_else(|| bare.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace(',', "."));

    let Some(number) = captured else {
        return Ok(None);
    };
    let value: f64 = number.parse().map_err(|_| RejectReason::InvalidDiscount)?;
    if !(0.0..=100.0).contains(&value) {
        return Err(RejectReason::InvalidDiscount);
    }
    Ok(Some(value))
}
