use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, warn};

use super::traits::{ImageSource, SourceBody, SourceInfo};
use crate::config::EngineConfig;
use crate::error::FetchError;

pub struct HttpSource {
    client: Client,
    headers: RwLock<HashMap<String, String>>,
}

impl HttpSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            headers: RwLock::new(HashMap::new()),
        }
    }

    /// Build a client from the engine's timeout and user agent settings.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }
        Ok(Self::new(builder.build()?))
    }

    /// Replace the extra headers sent with every request (e.g. cookies or auth).
    pub fn set_headers(&self, headers: HashMap<String, String>) {
        *self.headers.write() = headers;
    }

    fn build_request(&self, url: &str) -> RequestBuilder {
        let headers = self.headers.read().clone();
        let mut req = self.client.get(url);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

struct HttpBody {
    response: Response,
    info: SourceInfo,
}

#[async_trait]
impl SourceBody for HttpBody {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.response.chunk().await {
            Ok(chunk) => Ok(chunk),
            Err(e) => Err(FetchError::Transport(e.to_string()).into()),
        }
    }
}

#[async_trait]
impl ImageSource for HttpSource {
    async fn open(&self, url: &str) -> Result<Box<dyn SourceBody>> {
        let response = match self.build_request(url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("http open failed url={} error={}", url, e);
                return Err(FetchError::Transport(e.to_string()).into());
            }
        };

        let status = response.status();
        debug!("http open status={} url={}", status.as_u16(), url);
        if !status.is_success() {
            warn!("http open rejected status={} url={}", status.as_u16(), url);
            return Err(FetchError::Status(status.as_u16()).into());
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let info = SourceInfo {
            content_length: response.content_length(),
            content_type,
        };

        Ok(Box::new(HttpBody { response, info }))
    }
}
