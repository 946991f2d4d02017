//! # Normalizer
//! Pure mapping from raw payloads to canonical listings, one parser per
//! source family. Deterministic given identical input — the only clock use
//! is the `normalized_at` stamp the caller passes in — so fingerprinting and
//! testing stay tractable.
//!
//! Malformed payloads and invalid records are reported and dropped, never
//! retried: a parsing defect will not self-heal on retry.

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use quick_xml::de::from_str;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::types::{NormalizedListing, RawPayload, SourceFamily};

/// Validation failure naming the missing/invalid field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeError {
    pub field: &'static str,
    pub detail: String,
}

impl NormalizeError {
    fn new(field: &'static str, detail: impl Into<String>) -> Self {
        Self {
            field,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid listing field `{}`: {}", self.field, self.detail)
    }
}

impl std::error::Error for NormalizeError {}

/// Listings extracted from one payload, plus per-record rejections.
#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub listings: Vec<NormalizedListing>,
    pub rejected: Vec<NormalizeError>,
}

/// Normalize text: decode HTML entities, strip tags, normalize quotes,
/// collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = RE_TAGS.replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
    out = RE_WS.replace_all(&out, " ").trim().to_string();

    // Length cap: job descriptions can be huge; downstream search indexes
    // the first few KB anyway.
    if out.chars().count() > 4000 {
        out = out.chars().take(4000).collect();
    }
    out
}

/// Lexicon-based skill extraction over the description.
static SKILL_LEXICON: &[&str] = &[
    "python",
    "java",
    "javascript",
    "typescript",
    "rust",
    "go",
    "sql",
    "aws",
    "gcp",
    "docker",
    "kubernetes",
    "react",
    "angular",
    "vue",
    "node.js",
    "mongodb",
    "postgresql",
    "redis",
    "machine learning",
    "data science",
    "ai",
    "product management",
];

static SKILL_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    SKILL_LEXICON
        .iter()
        .map(|s| {
            let pat = format!(r"(?i)\b{}\b", regex::escape(s));
            (*s, Regex::new(&pat).unwrap())
        })
        .collect()
});

pub fn extract_skills(description: &str) -> Vec<String> {
    SKILL_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(description))
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Listing id derived from the payload fingerprint and the listing's own
/// URL, so entries within one payload stay distinct while re-fetches of
/// identical content map to the same id.
pub fn derive_listing_id(fingerprint: &str, source_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_url.as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

/// Map a raw payload into canonical listings. `now` becomes `normalized_at`
/// and the upper bound for `posted_at`.
pub fn normalize(
    family: SourceFamily,
    payload: &RawPayload,
    fingerprint: &str,
    now: DateTime<Utc>,
) -> Result<NormalizeReport, NormalizeError> {
    let candidates = match family {
        SourceFamily::Rss => parse_rss(payload)?,
        SourceFamily::Html => parse_html(payload)?,
        SourceFamily::Api => parse_api(payload)?,
    };

    let mut report = NormalizeReport::default();
    for c in candidates {
        match finish(c, fingerprint, now) {
            Ok(listing) => report.listings.push(listing),
            Err(e) => {
                tracing::warn!(source_id = %payload.source_id, field = e.field, detail = %e.detail, "listing rejected");
                metrics::counter!("harvester_listings_rejected_total", "field" => e.field)
                    .increment(1);
                report.rejected.push(e);
            }
        }
    }
    Ok(report)
}

/// Raw field set extracted by a family parser, before validation.
#[derive(Debug, Default)]
struct Candidate {
    title: String,
    company: String,
    location: String,
    description: String,
    posted_at: Option<DateTime<Utc>>,
    source_url: String,
}

fn finish(
    c: Candidate,
    fingerprint: &str,
    now: DateTime<Utc>,
) -> Result<NormalizedListing, NormalizeError> {
    let title = normalize_text(&c.title);
    let company = normalize_text(&c.company);
    let location = normalize_text(&c.location);
    let mut description = normalize_text(&c.description);
    if description.is_empty() {
        description = title.clone();
    }

    if title.is_empty() {
        return Err(NormalizeError::new("title", "empty after normalization"));
    }
    if company.is_empty() {
        return Err(NormalizeError::new("company", "empty after normalization"));
    }
    if location.is_empty() {
        return Err(NormalizeError::new("location", "empty after normalization"));
    }
    if c.source_url.trim().is_empty() {
        return Err(NormalizeError::new("source_url", "missing listing URL"));
    }

    let posted_at = c.posted_at.unwrap_or(now);
    if posted_at > now {
        return Err(NormalizeError::new(
            "posted_at",
            format!("{posted_at} is in the future"),
        ));
    }

    let skills = extract_skills(&description);
    Ok(NormalizedListing {
        listing_id: derive_listing_id(fingerprint, &c.source_url),
        title,
        company,
        location,
        description,
        posted_at,
        source_url: c.source_url.trim().to_string(),
        normalized_at: now,
        skills,
    })
}

// ---- RSS ----

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    author: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), 0))
}

static RE_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)location:\s*([^<.;|\n]+)").unwrap());

fn parse_rss(payload: &RawPayload) -> Result<Vec<Candidate>, NormalizeError> {
    let xml = scrub_html_entities_for_xml(&payload.content_str());
    let rss: Rss = from_str(&xml)
        .map_err(|e| NormalizeError::new("payload", format!("rss parse: {e}")))?;

    let feed_title = rss.channel.title.unwrap_or_default();
    let mut out = Vec::with_capacity(rss.channel.items.len());
    for it in rss.channel.items {
        let description = it.description.unwrap_or_default();
        let location = RE_LOCATION
            .captures(&description)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| "Unspecified".to_string());
        out.push(Candidate {
            title: it.title.unwrap_or_default(),
            company: it.author.unwrap_or_else(|| feed_title.clone()),
            location,
            description,
            posted_at: it.pub_date.as_deref().and_then(parse_rfc2822),
            source_url: it.link.unwrap_or_default(),
        });
    }
    Ok(out)
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

// ---- HTML ----
//
// Site-specific DOM extraction is a pluggable concern; the generic HTML
// family understands the job-card microformat our scrape templates emit:
// `<div class="job-card" data-title=".." data-company=".." ...>desc</div>`.

static RE_JOB_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<div\s+class="job-card"([^>]*)>(.*?)</div>"#).unwrap());
static RE_DATA_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-([a-z]+)="([^"]*)""#).unwrap());

fn parse_html(payload: &RawPayload) -> Result<Vec<Candidate>, NormalizeError> {
    let html = payload.content_str();
    let mut out = Vec::new();
    for card in RE_JOB_CARD.captures_iter(&html) {
        let attrs = card.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = card.get(2).map(|m| m.as_str()).unwrap_or_default();

        let mut c = Candidate {
            description: body.to_string(),
            ..Candidate::default()
        };
        for attr in RE_DATA_ATTR.captures_iter(attrs) {
            let value = attr[2].to_string();
            match &attr[1] {
                "title" => c.title = value,
                "company" => c.company = value,
                "location" => c.location = value,
                "url" => c.source_url = value,
                "posted" => {
                    c.posted_at = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc));
                }
                _ => {}
            }
        }
        out.push(c);
    }
    Ok(out)
}

// ---- API ----

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    jobs: Vec<ApiJob>,
}

#[derive(Debug, Deserialize)]
struct ApiJob {
    #[serde(default)]
    title: String,
    #[serde(default)]
    company: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    description: String,
    posted_at: Option<String>,
    #[serde(default)]
    url: String,
}

fn parse_api(payload: &RawPayload) -> Result<Vec<Candidate>, NormalizeError> {
    let resp: ApiResponse = serde_json::from_slice(&payload.content_bytes)
        .map_err(|e| NormalizeError::new("payload", format!("api parse: {e}")))?;

    Ok(resp
        .jobs
        .into_iter()
        .map(|j| Candidate {
            title: j.title,
            company: j.company,
            location: j.location,
            description: j.description,
            posted_at: j
                .posted_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            source_url: j.url,
        })
        .collect())
}
