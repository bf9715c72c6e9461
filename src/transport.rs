use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::Client;

use crate::error::{DeskError, Result};

pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// One hop of a GET. Redirects are not followed here; the caller sees the
/// 3xx status and the `Location` header and decides.
pub struct TransportResponse {
    pub status: u16,
    pub location: Option<String>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        // Byte counts must match Content-Length, so no transparent decompression.
        let http = Client::builder()
            .redirect(Policy::none())
            .no_gzip()
            .user_agent(concat!("multidesk/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = resp.content_length().filter(|n| *n > 0);
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(DeskError::from))
            .boxed();
        Ok(TransportResponse { status, location, content_length, body })
    }
}
