use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use crate::error::{ScrapeError, ScrapeResult};

/// Logical field names the reconciliation step understands
pub mod fields {
    pub const NAME: &str = "name";
    pub const PRICE: &str = "price";
    pub const DISCOUNT: &str = "discount";
    pub const SKU: &str = "sku";
    pub const IMAGE_URL: &str = "image_url";
    pub const PRODUCT_URL: &str = "product_url";
    pub const AVAILABILITY: &str = "availability";
}

/// Declarative mapping from logical fields to selection rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMap {
    /// Selector matching one product card
    pub card_selector: String,
    pub fields: BTreeMap<String, FieldRule>,
}

/// How to read one field out of a card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    /// Selector relative to the card. Empty means the card element itself.
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub extraction: ExtractionMethod,
    #[serde(default)]
    pub transforms: Vec<Transform>,
}

impl FieldRule {
    pub fn text(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            extraction: ExtractionMethod::Text,
            transforms: Vec::new(),
        }
    }

    pub fn attr(selector: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            extraction: ExtractionMethod::Attribute { name: name.into() },
            transforms: Vec::new(),
        }
    }

    pub fn with_extraction(mut self, extraction: ExtractionMethod) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractionMethod {
    #[default]
    Text,
    Html,
    Attribute { name: String },
    Href,
    Src,
}

/// Text transformation applied after extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    Trim,
    CollapseWhitespace,
    Lowercase,
    Uppercase,
    Regex { pattern: String, replacement: String },
    RemoveHtml,
}

/// Unvalidated field values scraped from one card
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawCandidate {
    /// Position of the card in page-scan order
    pub position: usize,
    pub fields: BTreeMap<String, String>,
}

impl RawCandidate {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }
}

/// Result of extracting one page
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub candidates: Vec<RawCandidate>,
    pub has_next_page: bool,
}

enum CompiledTransform {
    Trim,
    CollapseWhitespace,
    Lowercase,
    Uppercase,
    Regex { regex: Regex, replacement: String },
    RemoveHtml(Regex),
}

struct CompiledRule {
    name: String,
    selector: Option<Selector>,
    extraction: ExtractionMethod,
    transforms: Vec<CompiledTransform>,
}

/// Compiled, reusable extractor. Extraction is pure and never performs I/O.
pub struct Extractor {
    card: Selector,
    rules: Vec<CompiledRule>,
    next_page: Selector,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("fields", &self.rules.iter().map(|r| r.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

fn parse_selector(field: &str, selector: &str) -> ScrapeResult<Selector> {
    Selector::parse(selector).map_err(|_| ScrapeError::InvalidSelector {
        field: field.to_string(),
        selector: selector.to_string(),
    })
}

fn compile_transform(field: &str, transform: &Transform) -> ScrapeResult<CompiledTransform> {
    let compiled = match transform {
        Transform::Trim => CompiledTransform::Trim,
        Transform::CollapseWhitespace => CompiledTransform::CollapseWhitespace,
        Transform::Lowercase => CompiledTransform::Lowercase,
        Transform::Uppercase => CompiledTransform::Uppercase,
        Transform::Regex { pattern, replacement } => {
            let regex = Regex::new(pattern).map_err(|e| {
                ScrapeError::config(format!("invalid regex for field '{}': {}", field, e))
            })?;
            CompiledTransform::Regex {
                regex,
                replacement: replacement.clone(),
            }
        }
        Transform::RemoveHtml => CompiledTransform::RemoveHtml(
            Regex::new(r"<[^>]*>").map_err(|e| ScrapeError::internal(e.to_string()))?,
        ),
    };
    Ok(compiled)
}

impl Extractor {
    /// Compile a field map. Fails on any selector or regex that does not parse.
    pub fn compile(field_map: &FieldMap, next_page_selector: &str) -> ScrapeResult<Self> {
        if field_map.card_selector.trim().is_empty() {
            return Err(ScrapeError::config("card_selector must not be empty"));
        }
        if next_page_selector.trim().is_empty() {
            return Err(ScrapeError::config("next_page_selector must not be empty"));
        }

        let card = parse_selector("card", &field_map.card_selector)?;
        let next_page = parse_selector("next_page", next_page_selector)?;

        let mut rules = Vec::with_capacity(field_map.fields.len());
        for (name, rule) in &field_map.fields {
            let selector = if rule.selector.trim().is_empty() {
                None
            } else {
                Some(parse_selector(name, &rule.selector)?)
            };
            let transforms = rule
                .transforms
                .iter()
                .map(|t| compile_transform(name, t))
                .collect::<ScrapeResult<Vec<_>>>()?;

            rules.push(CompiledRule {
                name: name.clone(),
                selector,
                extraction: rule.extraction.clone(),
                transforms,
            });
        }

        Ok(Self { card, rules, next_page })
    }

    /// Parse rendered markup into candidates and detect an enabled next-page control
    pub fn extract(&self, markup: &str, page_url: Option<&Url>) -> ScrapeResult<ExtractionOutcome> {
        if markup.trim().is_empty() {
            return Err(ScrapeError::malformed("empty document"));
        }
        if !markup.contains('<') {
            return Err(ScrapeError::malformed("document contains no markup"));
        }

        let document = Html::parse_document(markup);

        let candidates: Vec<RawCandidate> = document
            .select(&self.card)
            .enumerate()
            .map(|(position, card)| self.extract_card(position, &card, page_url))
            .collect();

        let has_next_page = document
            .select(&self.next_page)
            .any(|control| !is_disabled(&control));

        debug!(
            "Extracted {} candidates (next page: {})",
            candidates.len(),
            has_next_page
        );

        Ok(ExtractionOutcome {
            candidates,
            has_next_page,
        })
    }

    fn extract_card(&self, position: usize, card: &ElementRef<'_>, page_url: Option<&Url>) -> RawCandidate {
        let mut candidate = RawCandidate {
            position,
            fields: BTreeMap::new(),
        };

        for rule in &self.rules {
            let target = match &rule.selector {
                Some(selector) => card.select(selector).next(),
                None => Some(*card),
            };
            let Some(target) = target else {
                continue;
            };
            let Some(value) = extract_value(&target, &rule.extraction, page_url) else {
                continue;
            };
            let value = rule
                .transforms
                .iter()
                .fold(value, |value, transform| apply_transform(value, transform));
            candidate.fields.insert(rule.name.clone(), value);
        }

        candidate
    }
}

fn extract_value(element: &ElementRef<'_>, method: &ExtractionMethod, page_url: Option<&Url>) -> Option<String> {
    match method {
        ExtractionMethod::Text => Some(element.text().collect::<Vec<_>>().join(" ").trim().to_string()),
        ExtractionMethod::Html => Some(element.inner_html()),
        ExtractionMethod::Attribute { name } => element.value().attr(name).map(str::to_string),
        ExtractionMethod::Href => element.value().attr("href").map(|href| resolve_url(href, page_url)),
        ExtractionMethod::Src => element
            .value()
            .attr("src")
            .or_else(|| element.value().attr("data-src"))
            .map(|src| resolve_url(src, page_url)),
    }
}

/// Resolve a possibly relative link against the page it came from
fn resolve_url(link: &str, page_url: Option<&Url>) -> String {
    match page_url.and_then(|base| base.join(link).ok()) {
        Some(absolute) => absolute.to_string(),
        None => link.to_string(),
    }
}

fn apply_transform(value: String, transform: &CompiledTransform) -> String {
    match transform {
        CompiledTransform::Trim => value.trim().to_string(),
        CompiledTransform::CollapseWhitespace => collapse_whitespace(&value),
        CompiledTransform::Lowercase => value.to_lowercase(),
        CompiledTransform::Uppercase => value.to_uppercase(),
        CompiledTransform::Regex { regex, replacement } => regex.replace_all(&value, replacement.as_str()).to_string(),
        CompiledTransform::RemoveHtml(regex) => regex.replace_all(&value, "").to_string(),
    }
}

/// Trim and collapse internal runs of whitespace to a single space
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn is_disabled(element: &ElementRef<'_>) -> bool {
    let node = element.value();
    if node.attr("disabled").is_some() {
        return true;
    }
    if node
        .attr("aria-disabled")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return true;
    }
    node.classes().any(|class| class.eq_ignore_ascii_case("disabled"))
}
