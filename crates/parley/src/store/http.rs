//! Log store client for a remote Durable-Streams-style server.

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use log::debug;
use reqwest::{Client, Method, RequestBuilder};
use std::time::Duration;

use super::{LogStore, ReadOptions, StoreBody, StoreResponse};
use crate::error::{ParleyError, ParleyResult};

/// Talks to a remote log store over HTTP. Each session maps to
/// `{base_url}/{session_id}`.
#[derive(Debug, Clone)]
pub struct HttpLogStore {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpLogStore {
    /// Create a client. `request_timeout` bounds every non-live request;
    /// live reads are only bounded by the connect timeout.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> ParleyResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ParleyError::internal(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    fn stream_url(&self, session_id: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(session_id))
    }

    fn request(&self, method: Method, session_id: &str) -> RequestBuilder {
        self.client.request(method, self.stream_url(session_id))
    }

    async fn send(&self, builder: RequestBuilder, live: bool) -> ParleyResult<StoreResponse> {
        let builder = if live {
            builder
        } else {
            builder.timeout(self.request_timeout)
        };

        let response = builder.send().await.map_err(ParleyError::from_reqwest)?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| ParleyError::internal(format!("invalid status from store: {}", e)))?;
        let headers = convert_headers(response.headers());

        // Only a successful live read is streamed; error bodies are small.
        let body = if live && status.is_success() {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ParleyError::from_reqwest));
            StoreBody::Stream(Box::pin(stream))
        } else {
            StoreBody::Bytes(response.bytes().await.map_err(ParleyError::from_reqwest)?)
        };

        Ok(StoreResponse {
            status,
            headers,
            body,
        })
    }
}

/// Copy reqwest's header map into axum's. Both use the `http` crate, but
/// going through names and bytes keeps us independent of their versions.
fn convert_headers(source: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in source {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

fn apply_headers(mut builder: RequestBuilder, headers: &HeaderMap) -> RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder
}

#[async_trait]
impl LogStore for HttpLogStore {
    async fn create(&self, session_id: &str, content_type: &str) -> ParleyResult<StoreResponse> {
        debug!("Creating stream {}", session_id);
        let builder = self
            .request(Method::PUT, session_id)
            .header("content-type", content_type);
        self.send(builder, false).await
    }

    async fn append(
        &self,
        session_id: &str,
        body: Bytes,
        headers: HeaderMap,
    ) -> ParleyResult<StoreResponse> {
        let builder = apply_headers(self.request(Method::POST, session_id), &headers).body(body);
        self.send(builder, false).await
    }

    async fn read(&self, session_id: &str, options: &ReadOptions) -> ParleyResult<StoreResponse> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(offset) = options.offset.as_deref() {
            query.push(("offset", offset));
        }
        if let Some(cursor) = options.cursor.as_deref() {
            query.push(("cursor", cursor));
        }
        if options.live {
            query.push(("live", "sse"));
        }

        let builder = self.request(Method::GET, session_id).query(&query);
        self.send(builder, options.live).await
    }

    async fn head(&self, session_id: &str) -> ParleyResult<StoreResponse> {
        self.send(self.request(Method::HEAD, session_id), false)
            .await
    }

    async fn delete(&self, session_id: &str) -> ParleyResult<StoreResponse> {
        debug!("Deleting stream {}", session_id);
        self.send(self.request(Method::DELETE, session_id), false)
            .await
    }
}
