use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use deeptable_error::DeeptableResult;

/// The verb of an [`ApiRequest`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Get,
    Put,
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Put => write!(f, "PUT"),
        }
    }
}

/// A single request made through a [`TileProxy`].
///
/// The endpoint is relative to whatever root the proxy was configured with, for example
/// `"2/1/3.feather"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiRequest {
    pub endpoint: String,
    pub method: Method,
    pub body: Option<Bytes>,
    pub query: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
}

impl ApiRequest {
    /// A `GET` request for the given endpoint.
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// A `PUT` request storing `body` at the given endpoint.
    pub fn put(endpoint: impl Into<String>, body: Bytes) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: Method::Put,
            body: Some(body),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// The endpoint with any leading slashes removed.
    pub fn normalized_endpoint(&self) -> &str {
        self.endpoint.trim_start_matches('/')
    }
}

impl Display for ApiRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.endpoint)?;
        for (idx, (key, value)) in self.query.iter().enumerate() {
            let sep = if idx == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

/// The transport used to fetch tiles, sidecars and manifests.
///
/// Implementations must be safe to call concurrently; the download scheduler keeps several
/// requests in flight at once.
#[async_trait]
pub trait TileProxy: Send + Sync + 'static {
    /// Perform the request and return the response body.
    async fn api_call(&self, request: ApiRequest) -> DeeptableResult<Bytes>;
}

#[async_trait]
impl<T: TileProxy + ?Sized> TileProxy for Arc<T> {
    async fn api_call(&self, request: ApiRequest) -> DeeptableResult<Bytes> {
        T::api_call(self, request).await
    }
}
