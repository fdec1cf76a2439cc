use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = TransportResult<Bytes>> + Send>>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("failed to read response body on `{stage}`, {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to decode response body on `{stage}`, {source}"))]
    DecodeBody {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("connection closed on `{stage}`"))]
    Disconnected { stage: &'static str },
}

/// Status line plus a body that has not been read yet.
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    pub fn new(status: u16, content_type: Option<String>, body: ByteStream) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True for `application/json` bodies, ignoring media type parameters.
    pub fn is_json(&self) -> bool {
        self.content_type.as_deref().is_some_and(|content_type| {
            content_type
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
        })
    }

    pub async fn bytes(self) -> TransportResult<Bytes> {
        let buffer = self
            .body
            .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        Ok(buffer.freeze())
    }

    pub async fn text(self) -> TransportResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T>(self) -> TransportResult<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).context(DecodeBodySnafu {
            stage: "transport-decode-json",
        })
    }
}

/// HTTP surface the session controller and client need from the generation service.
pub trait GenerationTransport: Send + Sync {
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: &'a serde_json::Value,
    ) -> BoxFuture<'a, TransportResult<TransportResponse>>;

    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, TransportResult<TransportResponse>>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("murmur/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(BuildClientSnafu {
                stage: "http-build-client",
            })?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn into_response(response: reqwest::Response) -> TransportResponse {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.context(ReadBodySnafu {
                    stage: "http-read-chunk",
                })
            })
            .boxed();

        TransportResponse::new(status, content_type, body)
    }
}

impl GenerationTransport for HttpTransport {
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: &'a serde_json::Value,
    ) -> BoxFuture<'a, TransportResult<TransportResponse>> {
        Box::pin(async move {
            tracing::debug!(url = %url, "posting generation request");
            let response = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .context(RequestSnafu {
                    stage: "http-post",
                    url,
                })?;
            Ok(Self::into_response(response))
        })
    }

    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, TransportResult<TransportResponse>> {
        Box::pin(async move {
            tracing::debug!(url = %url, "opening generation stream");
            let response = self.client.get(url).send().await.context(RequestSnafu {
                stage: "http-get",
                url,
            })?;
            Ok(Self::into_response(response))
        })
    }
}
