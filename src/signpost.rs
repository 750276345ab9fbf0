use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdentifierRecord {
    #[serde(default)]
    pub did: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub rev: Option<String>,
}

pub trait IdentifierClient: Send + Sync {
    fn get(&self, node_id: Uuid) -> Result<IdentifierRecord, IngestError>;
    fn patch(
        &self,
        node_id: Uuid,
        rev: Option<&str>,
        urls: &[String],
    ) -> Result<(), IngestError>;
}

pub fn register_url<I: IdentifierClient + ?Sized>(
    client: &I,
    node_id: Uuid,
    url: &str,
) -> Result<bool, IngestError> {
    let record = client.get(node_id)?;
    if record.urls.iter().any(|existing| existing == url) {
        debug!(%node_id, url, "url already registered");
        return Ok(false);
    }
    let mut urls = record.urls.clone();
    urls.push(url.to_string());
    client.patch(node_id, record.rev.as_deref(), &urls)?;
    info!(%node_id, url, "registered url");
    Ok(true)
}

#[derive(Serialize)]
struct PatchBody<'a> {
    urls: &'a [String],
}

#[derive(Clone)]
pub struct SignpostHttpClient {
    client: Client,
    base_url: String,
}

impl SignpostHttpClient {
    pub fn new(base_url: &str) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("bam-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::IdentifierServiceError(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| IngestError::IdentifierServiceError(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn record_url(&self, node_id: Uuid) -> String {
        format!("{}/{}", self.base_url, node_id)
    }

    fn expect_success(response: Response) -> Result<Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "identifier request failed".to_string());
        Err(IngestError::IdentifierServiceStatus { status, message })
    }
}

impl IdentifierClient for SignpostHttpClient {
    fn get(&self, node_id: Uuid) -> Result<IdentifierRecord, IngestError> {
        let response = self
            .client
            .get(self.record_url(node_id))
            .send()
            .map_err(|err| IngestError::IdentifierServiceError(err.to_string()))?;
        Self::expect_success(response)?
            .json()
            .map_err(|err| IngestError::IdentifierServiceError(err.to_string()))
    }

    fn patch(
        &self,
        node_id: Uuid,
        rev: Option<&str>,
        urls: &[String],
    ) -> Result<(), IngestError> {
        let mut request = self
            .client
            .patch(self.record_url(node_id))
            .json(&PatchBody { urls });
        if let Some(rev) = rev {
            request = request.query(&[("rev", rev)]);
        }
        let response = request
            .send()
            .map_err(|err| IngestError::IdentifierServiceError(err.to_string()))?;
        Self::expect_success(response)?;
        Ok(())
    }
}
