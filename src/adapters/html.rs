//! HTML scrape adapter for career pages rendered server-side. Extraction of
//! job cards from the markup lives in the normalizer; site-specific DOM
//! strategies plug in as separate adapters when a site needs one.

use async_trait::async_trait;

use super::{http_get, target_url, FetchMode, SourceAdapter};
use crate::proxy::Identity;
use crate::types::{ErrorClass, RawPayload, SourceFamily, Target};

pub struct HtmlAdapter {
    source_id: String,
    /// Search base for query-descriptor targets, when the site has one.
    search_base: Option<String>,
    mode: FetchMode,
}

impl HtmlAdapter {
    pub fn from_fixture(source_id: &str, html: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            search_base: None,
            mode: FetchMode::Fixture(html.to_string()),
        }
    }

    pub fn live(source_id: &str, search_base: Option<String>, timeout: std::time::Duration) -> Self {
        Self {
            source_id: source_id.to_string(),
            search_base,
            mode: FetchMode::Http { timeout },
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Html
    }

    async fn fetch(&self, target: &Target, identity: &Identity) -> Result<RawPayload, ErrorClass> {
        let bytes = match &self.mode {
            FetchMode::Fixture(html) => html.clone().into_bytes(),
            FetchMode::Http { timeout } => {
                let url = target_url(self.search_base.as_deref(), target)?;
                http_get(&url, identity, *timeout).await?
            }
        };
        Ok(RawPayload::new(&self.source_id, target.clone(), bytes))
    }
}
