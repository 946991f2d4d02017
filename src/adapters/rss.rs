//! RSS feed adapter: pulls a feed URL and hands the XML to the pipeline.
//! Feed parsing itself happens in the normalizer; the adapter only acquires
//! bytes and classifies transport failures.

use async_trait::async_trait;

use super::{http_get, target_url, FetchMode, SourceAdapter};
use crate::proxy::Identity;
use crate::types::{ErrorClass, RawPayload, SourceFamily, Target};

pub struct RssAdapter {
    source_id: String,
    mode: FetchMode,
}

impl RssAdapter {
    pub fn from_fixture(source_id: &str, xml: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            mode: FetchMode::Fixture(xml.to_string()),
        }
    }

    pub fn live(source_id: &str, timeout: std::time::Duration) -> Self {
        Self {
            source_id: source_id.to_string(),
            mode: FetchMode::Http { timeout },
        }
    }
}

#[async_trait]
impl SourceAdapter for RssAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Rss
    }

    async fn fetch(&self, target: &Target, identity: &Identity) -> Result<RawPayload, ErrorClass> {
        let bytes = match &self.mode {
            FetchMode::Fixture(xml) => xml.clone().into_bytes(),
            FetchMode::Http { timeout } => {
                // Feeds are URL-only; query descriptors have no meaning here.
                let url = target_url(None, target)?;
                http_get(&url, identity, *timeout).await?
            }
        };
        Ok(RawPayload::new(&self.source_id, target.clone(), bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::HeaderProfile;

    #[tokio::test]
    async fn fixture_mode_returns_payload_with_hash() {
        let adapter = RssAdapter::from_fixture("rss-acme", "<rss><channel/></rss>");
        let identity = Identity {
            id: 0,
            proxy_endpoint: None,
            header_profile: HeaderProfile::default(),
        };
        let payload = adapter
            .fetch(&Target::Url("https://acme.example/feed".into()), &identity)
            .await
            .unwrap();
        assert_eq!(payload.source_id, "rss-acme");
        assert!(!payload.content_hash.is_empty());
    }
}
