use reqwest::blocking::Client;
use std::time::Duration;
use tracing::{error, info};

/// Fetches programme artwork. Artwork is optional, so failures are logged
/// and reported as absent.
#[derive(Debug, Clone)]
pub struct ThumbnailSource {
    assets_url: String,
    http: Client,
}

impl ThumbnailSource {
    pub fn new(assets_url: impl Into<String>) -> crate::error::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            assets_url: assets_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn url(&self, uri: &str) -> String {
        format!("{}{uri}", self.assets_url)
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        if uri.is_empty() {
            return None;
        }
        let url = self.url(uri);
        info!(%url, "retrieving thumbnail");
        let fetched = self
            .http
            .get(&url)
            .send()
            .and_then(|res| res.error_for_status())
            .and_then(|res| res.bytes());
        match fetched {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(err) => {
                error!(%url, %err, "failed to get thumbnail");
                None
            }
        }
    }
}
