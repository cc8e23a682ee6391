use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use super::messages::{CommandRequest, CommandResponse, InfoExResponse};
use crate::error::{Result, ScanError};

/// Body of a `readImageBlock` answer, handed over before it is fully read.
pub struct MultipartResponse {
    /// Raw `Content-Type` header, if the scanner sent one.
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, ScanError>>,
}

/// Request/response plumbing to one scanner.
#[async_trait]
pub trait ScannerTransport: Send + Sync {
    /// Fetch `/privet/infoex` and remember the token and api endpoint it names.
    async fn resolve_token(&self) -> Result<InfoExResponse>;

    async fn command(&self, request: &CommandRequest) -> Result<CommandResponse>;

    async fn read_image_block(&self, request: &CommandRequest) -> Result<MultipartResponse>;
}
