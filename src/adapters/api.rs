//! JSON API adapter for job boards that expose a structured endpoint.
//! Supports both direct URLs and query descriptors against a search base.

use async_trait::async_trait;

use super::{http_get, target_url, FetchMode, SourceAdapter};
use crate::proxy::Identity;
use crate::types::{ErrorClass, RawPayload, SourceFamily, Target};

pub struct ApiAdapter {
    source_id: String,
    search_base: Option<String>,
    mode: FetchMode,
}

impl ApiAdapter {
    pub fn from_fixture(source_id: &str, json: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            search_base: None,
            mode: FetchMode::Fixture(json.to_string()),
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
impl SourceAdapter for ApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Api
    }

    async fn fetch(&self, target: &Target, identity: &Identity) -> Result<RawPayload, ErrorClass> {
        let bytes = match &self.mode {
            FetchMode::Fixture(json) => json.clone().into_bytes(),
            FetchMode::Http { timeout } => {
                let url = target_url(self.search_base.as_deref(), target)?;
                http_get(&url, identity, *timeout).await?
            }
        };
        Ok(RawPayload::new(&self.source_id, target.clone(), bytes))
    }
}
