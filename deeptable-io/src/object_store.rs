use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use deeptable_error::{DeeptableError, DeeptableResult};
use object_store::ObjectStore;
use object_store::path::Path;

use crate::{ApiRequest, Method, TileProxy};

/// A [`TileProxy`] backed by an [`ObjectStore`], for example an HTTP or S3 store.
///
/// Endpoints are resolved relative to `prefix`. Query parameters and options are not
/// forwarded; configure authentication on the store itself.
#[derive(Debug, Clone)]
pub struct ObjectStoreTileProxy {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl ObjectStoreTileProxy {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self { store, prefix }
    }

    fn resolve(&self, endpoint: &str) -> Path {
        endpoint
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.prefix.clone(), |path, part| path.child(part))
    }
}

#[async_trait]
impl TileProxy for ObjectStoreTileProxy {
    async fn api_call(&self, request: ApiRequest) -> DeeptableResult<Bytes> {
        let location = self.resolve(request.normalized_endpoint());
        log::debug!("object store proxy: {} {}", request.method, location);
        match request.method {
            Method::Get => {
                let result = self
                    .store
                    .get(&location)
                    .await
                    .map_err(|e| DeeptableError::from(e).with_context(format!("GET {location}")))?;
                Ok(result.bytes().await?)
            }
            Method::Put => {
                let body = request.body.unwrap_or_default();
                self.store
                    .put(&location, body.into())
                    .await
                    .map_err(|e| DeeptableError::from(e).with_context(format!("PUT {location}")))?;
                Ok(Bytes::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn round_trips_through_store() {
        let proxy = ObjectStoreTileProxy::new(Arc::new(InMemory::new()), Path::from("tiles"));
        proxy
            .api_call(ApiRequest::put("/0/0/0.feather", Bytes::from_static(b"root")))
            .await
            .unwrap();
        let bytes = proxy
            .api_call(ApiRequest::get("0/0/0.feather"))
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"root"));

        let missing = proxy.api_call(ApiRequest::get("1/0/0.feather")).await;
        assert!(missing.is_err());
    }
}
