//! Byte sources for transfer tasks.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TransferError;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An opened source body.
pub struct SourceStream {
    pub body: ByteStream,
    /// True when the body starts at the requested offset. False means the
    /// source restarted from byte 0 and the destination must be truncated.
    pub resumed: bool,
    /// Size of the whole object when the source reports it.
    pub total_size: Option<u64>,
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream")
            .field("resumed", &self.resumed)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// Something that can stream the bytes behind a locator.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Open `locator` starting at `offset`. A source that cannot honour the
    /// offset returns the full body with `resumed == false`.
    async fn open(&self, locator: &str, offset: u64) -> Result<SourceStream, TransferError>;
}

/// HTTP(S) source using range requests for resume.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn request(&self, locator: &str, offset: u64) -> Result<reqwest::Response, TransferError> {
        let mut request = self.client.get(locator);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        Ok(request.send().await?)
    }
}

/// `(start, total)` from `Content-Range: bytes start-end/total`. The total
/// is `None` when the server sends `*`.
fn content_range(response: &reqwest::Response) -> Option<(u64, Option<u64>)> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let (range, total) = value.strip_prefix("bytes ")?.split_once('/')?;
    let (start, _) = range.split_once('-')?;
    Some((start.trim().parse().ok()?, total.trim().parse().ok()))
}

fn into_body(response: reqwest::Response) -> ByteStream {
    response
        .bytes_stream()
        .map(|chunk| chunk.map_err(TransferError::from))
        .boxed()
}

#[async_trait]
impl SourceClient for HttpSource {
    async fn open(&self, locator: &str, offset: u64) -> Result<SourceStream, TransferError> {
        let mut response = self.request(locator, offset).await?;
        let mut offset = offset;

        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            warn!(url = locator, offset, "range not satisfiable, restarting from zero");
            offset = 0;
            response = self.request(locator, 0).await?;
        }

        if offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT {
            if let Some((start, _)) = content_range(&response) {
                if start != offset {
                    warn!(url = locator, offset, start, "partial response starts at the wrong byte, restarting from zero");
                    offset = 0;
                    response = self.request(locator, 0).await?;
                }
            }
        }

        let status = response.status();
        if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            let total_size = content_range(&response)
                .and_then(|(_, total)| total)
                .or_else(|| response.content_length().map(|len| offset + len));
            debug!(url = locator, offset, "resuming with range request");
            return Ok(SourceStream {
                body: into_body(response),
                resumed: true,
                total_size,
            });
        }

        if status.is_success() {
            if offset > 0 {
                warn!(url = locator, offset, status = status.as_u16(), "server ignored range request, restarting download");
            }
            let total_size = if status == StatusCode::PARTIAL_CONTENT {
                content_range(&response).and_then(|(_, total)| total)
            } else {
                response.content_length()
            };
            return Ok(SourceStream {
                body: into_body(response),
                resumed: false,
                total_size,
            });
        }

        Err(TransferError::Status {
            status: status.as_u16(),
            url: locator.to_string(),
        })
    }
}
