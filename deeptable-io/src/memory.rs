use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use deeptable_error::{DeeptableResult, deeptable_bail};
use parking_lot::{Mutex, RwLock};

use crate::{ApiRequest, Method, TileProxy};

/// A [`TileProxy`] serving objects from a map held in memory.
///
/// Every request is recorded, which makes the proxy convenient for asserting exactly which
/// tiles a Deeptable fetched.
#[derive(Debug, Default)]
pub struct InMemoryTileProxy {
    objects: RwLock<HashMap<String, Bytes>>,
    failing: RwLock<HashSet<String>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl InMemoryTileProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` at `endpoint`, replacing any previous object.
    pub fn insert(&self, endpoint: impl AsRef<str>, bytes: impl Into<Bytes>) {
        self.objects
            .write()
            .insert(endpoint.as_ref().trim_start_matches('/').to_string(), bytes.into());
    }

    /// Make every request for `endpoint` fail, even if an object is stored there.
    pub fn fail(&self, endpoint: impl AsRef<str>) {
        self.failing
            .write()
            .insert(endpoint.as_ref().trim_start_matches('/').to_string());
    }

    /// Whether an object is stored at `endpoint`.
    pub fn contains(&self, endpoint: &str) -> bool {
        self.objects
            .read()
            .contains_key(endpoint.trim_start_matches('/'))
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    /// The normalized endpoints of every `GET` received so far, in arrival order.
    pub fn fetched_endpoints(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == Method::Get)
            .map(|r| r.normalized_endpoint().to_string())
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }
}

#[async_trait]
impl TileProxy for InMemoryTileProxy {
    async fn api_call(&self, request: ApiRequest) -> DeeptableResult<Bytes> {
        log::trace!("in-memory proxy: {request}");
        self.requests.lock().push(request.clone());

        let endpoint = request.normalized_endpoint();
        if self.failing.read().contains(endpoint) {
            deeptable_bail!(FetchFailure: "injected failure for {}", endpoint);
        }

        match request.method {
            Method::Get => match self.objects.read().get(endpoint) {
                Some(bytes) => Ok(bytes.clone()),
                None => deeptable_bail!(FetchFailure: "no object stored at {}", endpoint),
            },
            Method::Put => {
                let body = request.body.clone().unwrap_or_default();
                self.objects.write().insert(endpoint.to_string(), body);
                Ok(Bytes::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn proxy() -> InMemoryTileProxy {
        let proxy = InMemoryTileProxy::new();
        proxy.insert("0/0/0.feather", Bytes::from_static(b"root"));
        proxy
    }

    #[rstest]
    #[tokio::test]
    async fn serves_and_records(proxy: InMemoryTileProxy) {
        let bytes = proxy
            .api_call(ApiRequest::get("/0/0/0.feather"))
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"root"));
        assert_eq!(proxy.fetched_endpoints(), vec!["0/0/0.feather".to_string()]);
    }

    #[rstest]
    #[tokio::test]
    async fn missing_object_is_fetch_failure(proxy: InMemoryTileProxy) {
        let err = proxy
            .api_call(ApiRequest::get("1/0/0.feather"))
            .await
            .unwrap_err();
        assert!(err.is_fetch_failure());
        assert_eq!(proxy.requests().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn injected_failure(proxy: InMemoryTileProxy) {
        proxy.fail("0/0/0.feather");
        assert!(
            proxy
                .api_call(ApiRequest::get("0/0/0.feather"))
                .await
                .is_err()
        );
    }

    #[rstest]
    #[tokio::test]
    async fn put_then_get(proxy: InMemoryTileProxy) {
        proxy
            .api_call(ApiRequest::put("x.feather", Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert!(proxy.contains("x.feather"));
        assert_eq!(proxy.fetched_endpoints(), Vec::<String>::new());
    }
}
