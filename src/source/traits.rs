use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    /// Declared body length, when the upstream announces one.
    pub content_length: Option<u64>,
    pub content_type: String,
}

/// A response body being pulled chunk by chunk.
#[async_trait]
pub trait SourceBody: Send {
    fn info(&self) -> &SourceInfo;

    /// Next chunk of the body, `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Where image bytes come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn SourceBody>>;
}
