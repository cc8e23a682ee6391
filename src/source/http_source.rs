use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Url};
use tracing::{debug, info, warn};

use super::messages::{CommandRequest, CommandResponse, InfoExResponse};
use super::traits::{MultipartResponse, ScannerTransport};
use crate::config::{JSON_CONTENT_TYPE, PRIVET_TOKEN_HEADER};
use crate::error::{Result, ScanError};

pub struct HttpTransport {
    client: Client,
    base_url: Url,
    endpoint: Arc<RwLock<Option<Endpoint>>>,
}

#[derive(Clone)]
struct Endpoint {
    api_url: Url,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| ScanError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        Ok(Self {
            client,
            base_url,
            endpoint: Arc::new(RwLock::new(None)),
        })
    }

    /// Replace the capability token (e.g. after the scanner rotated it).
    pub fn update_token(&self, token: String) {
        if let Some(endpoint) = self.endpoint.write().as_mut() {
            endpoint.token = token;
        }
    }

    fn endpoint(&self) -> Result<Endpoint> {
        self.endpoint.read().clone().ok_or(ScanError::MissingApi)
    }

    /// Build a command POST carrying the token and JSON content negotiation headers.
    fn build_request(&self, endpoint: &Endpoint, request: &CommandRequest) -> RequestBuilder {
        self.client
            .post(endpoint.api_url.clone())
            .header(PRIVET_TOKEN_HEADER, endpoint.token.as_str())
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(ACCEPT, JSON_CONTENT_TYPE)
            .json(request)
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl ScannerTransport for HttpTransport {
    async fn resolve_token(&self) -> Result<InfoExResponse> {
        let url = self.join("/privet/infoex")?;
        let resp = self
            .client
            .get(url)
            .header(PRIVET_TOKEN_HEADER, "")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            warn!("infoex failed status={}", status.as_u16());
            return Err(ScanError::HttpStatus(status.as_u16()));
        }
        let body = resp.bytes().await?;
        if body.is_empty() {
            return Err(ScanError::NoResponseBody);
        }

        let info: InfoExResponse = serde_json::from_slice(&body)?;
        let api = info
            .api
            .as_ref()
            .and_then(|apis| apis.first())
            .ok_or(ScanError::MissingApi)?;
        let api_url = self.join(api)?;
        info!(
            "scanner infoex type={} model={} api={}",
            info.device_type,
            info.model.as_deref().unwrap_or("-"),
            api_url
        );

        *self.endpoint.write() = Some(Endpoint {
            api_url,
            token: info.privet_token.clone(),
        });
        Ok(info)
    }

    async fn command(&self, request: &CommandRequest) -> Result<CommandResponse> {
        let endpoint = self.endpoint()?;
        debug!(
            "command method={} command_id={}",
            request.method, request.command_id
        );
        let resp = self.build_request(&endpoint, request).send().await?;

        let status = resp.status();
        let body = resp.bytes().await?;
        if body.is_empty() {
            if !status.is_success() {
                return Err(ScanError::HttpStatus(status.as_u16()));
            }
            return Err(ScanError::NoResponseBody);
        }

        match serde_json::from_slice::<CommandResponse>(&body) {
            Ok(response) => Ok(response),
            Err(_) if !status.is_success() => {
                warn!(
                    "command failed method={} status={}",
                    request.method,
                    status.as_u16()
                );
                Err(ScanError::HttpStatus(status.as_u16()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_image_block(&self, request: &CommandRequest) -> Result<MultipartResponse> {
        let endpoint = self.endpoint()?;
        let resp = self.build_request(&endpoint, request).send().await?;

        let status = resp.status();
        if !status.is_success() {
            warn!(
                "readImageBlock failed status={} command_id={}",
                status.as_u16(),
                request.command_id
            );
            return Err(ScanError::HttpStatus(status.as_u16()));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = resp.bytes_stream().map_err(ScanError::from).boxed();

        Ok(MultipartResponse { content_type, body })
    }
}
