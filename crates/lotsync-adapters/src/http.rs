use async_trait::async_trait;
use chrono::NaiveDate;
use lotsync_storage::{HttpClientConfig, HttpFetcher};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::{
    parse_change_cursor, parse_changes_page, parse_offers_page, ChangesPage, ListingApi,
    OffersPage, UpstreamError,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub offers: String,
    pub change_id: String,
    pub changes: String,
    pub offer: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            offers: "/offers".into(),
            change_id: "/change_id".into(),
            changes: "/changes".into(),
            offer: "/offer".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL; `{access_name}` is substituted on construction.
    pub base_url: String,
    pub access_name: String,
    pub api_key: String,
    pub endpoints: Endpoints,
    pub http: HttpClientConfig,
}

pub struct HttpListingApi {
    fetcher: HttpFetcher,
    base_url: String,
    api_key: String,
    endpoints: Endpoints,
    run_id: Uuid,
}

impl HttpListingApi {
    pub fn new(config: ApiConfig, run_id: Uuid) -> anyhow::Result<Self> {
        if config.api_key.trim().is_empty() {
            anyhow::bail!("upstream api key is not configured (LOTSYNC_API_KEY)");
        }
        let base_url = config
            .base_url
            .replace("{access_name}", &config.access_name)
            .trim_end_matches('/')
            .to_string();
        Url::parse(&base_url).map_err(|e| anyhow::anyhow!("invalid api base url {base_url}: {e}"))?;
        Ok(Self {
            fetcher: HttpFetcher::new(config.http)?,
            base_url,
            api_key: config.api_key,
            endpoints: config.endpoints,
            run_id,
        })
    }

    fn url(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Url, UpstreamError> {
        let raw = format!("{}{}", self.base_url, endpoint);
        let mut url = Url::parse(&raw).map_err(|e| UpstreamError::Shape {
            endpoint: "url",
            message: format!("{raw}: {e}"),
        })?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
            query.append_pair("api_key", &self.api_key);
        }
        Ok(url)
    }

    async fn get(&self, endpoint: &str, params: &[(&str, String)]) -> Result<JsonValue, UpstreamError> {
        let url = self.url(endpoint, params)?;
        debug!(endpoint, "requesting upstream");
        Ok(self.fetcher.fetch_json(self.run_id, &url).await?)
    }
}

#[async_trait]
impl ListingApi for HttpListingApi {
    async fn list_offers(&self, page: u32) -> Result<OffersPage, UpstreamError> {
        let body = self
            .get(&self.endpoints.offers, &[("page", page.to_string())])
            .await?;
        parse_offers_page(&body)
    }

    async fn change_cursor(&self, date: NaiveDate) -> Result<Option<i64>, UpstreamError> {
        let body = self
            .get(
                &self.endpoints.change_id,
                &[("date", date.format("%Y-%m-%d").to_string())],
            )
            .await?;
        parse_change_cursor(&body)
    }

    async fn changes(&self, cursor: i64) -> Result<ChangesPage, UpstreamError> {
        let body = self
            .get(&self.endpoints.changes, &[("change_id", cursor.to_string())])
            .await?;
        parse_changes_page(&body)
    }

    async fn offer(&self, external_id: &str) -> Result<JsonValue, UpstreamError> {
        self.get(&self.endpoints.offer, &[("inner_id", external_id.to_string())])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> HttpListingApi {
        HttpListingApi::new(
            ApiConfig {
                base_url: "https://{access_name}.api.example/v1/".into(),
                access_name: "acme".into(),
                api_key: "k3y".into(),
                endpoints: Endpoints::default(),
                http: HttpClientConfig::default(),
            },
            Uuid::new_v4(),
        )
        .expect("api")
    }

    #[test]
    fn urls_carry_params_and_key() {
        let url = api()
            .url("/changes", &[("change_id", "42".to_string())])
            .expect("url");
        assert_eq!(url.host_str(), Some("acme.api.example"));
        assert_eq!(url.path(), "/v1/changes");
        assert_eq!(url.query(), Some("change_id=42&api_key=k3y"));
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let err = HttpListingApi::new(
            ApiConfig {
                base_url: "https://api.example".into(),
                access_name: String::new(),
                api_key: " ".into(),
                endpoints: Endpoints::default(),
                http: HttpClientConfig::default(),
            },
            Uuid::new_v4(),
        )
        .err()
        .expect("should fail");
        assert!(err.to_string().contains("LOTSYNC_API_KEY"));
    }
}
