use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use url::Url;

/// Response body delivered chunk by chunk. Dropping it releases the connection.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A fully signed request ready to go on the wire
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Sends signed requests. The default implementation is [`ReqwestTransport`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Read a body stream to the end.
pub async fn collect_body(mut body: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// HTTP transport backed by reqwest
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_collect_body_concatenates_chunks() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
        .boxed();
        assert_eq!(collect_body(body).await.unwrap(), Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_collect_body_surfaces_stream_error() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(Error::InvalidResponse("connection reset".to_string())),
        ])
        .boxed();
        assert!(collect_body(body).await.is_err());
    }

    #[tokio::test]
    async fn test_reqwest_transport_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/bucket/key")
            .match_header("x-test", "1")
            .match_body("payload")
            .with_status(200)
            .with_header("etag", "\"abc\"")
            .with_body("ok")
            .create_async()
            .await;

        let transport = ReqwestTransport::new(Some(Duration::from_secs(5))).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-test", "1".parse().unwrap());
        let response = transport
            .send(HttpRequest {
                method: Method::PUT,
                url: Url::parse(&format!("{}/bucket/key", server.url())).unwrap(),
                headers,
                body: Bytes::from("payload"),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get("etag").unwrap(), "\"abc\"");
        assert_eq!(collect_body(response.body).await.unwrap(), Bytes::from("ok"));
    }
}
