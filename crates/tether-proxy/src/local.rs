use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::body::json_response;
use crate::cache::{CacheKey, CacheManager};
use crate::classify::{PolicyClass, RequestInfo, Verb};
use crate::error::ProxyError;

/// Answers from the durable cache while the upstream is unreachable.
///
/// Only lists of a supported kind under the durable policy can be served.
/// Deletes are refused with 403; everything else is a 400.
pub struct LocalProxy {
    cache: Arc<CacheManager>,
}

impl LocalProxy {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }

    pub async fn serve(&self, info: &RequestInfo) -> Response {
        match self.handle(info).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(request=%info, error=%e, "could not proxy local");
                e.into_response()
            }
        }
    }

    async fn handle(&self, info: &RequestInfo) -> Result<Response, ProxyError> {
        if !info.is_resource_request {
            return Err(ProxyError::UnsupportedInDegradedMode(info.to_string()));
        }
        match info.verb {
            Verb::Delete | Verb::DeleteCollection => Err(ProxyError::Forbidden {
                name: info.name.clone(),
                group: info.api_group.clone(),
                kind: info.resource.clone(),
            }),
            _ => self.read_from_cache(info).await,
        }
    }

    async fn read_from_cache(&self, info: &RequestInfo) -> Result<Response, ProxyError> {
        let key = match CacheKey::for_request(info) {
            Some(key) if info.policy == PolicyClass::Durable => key,
            _ => return Err(ProxyError::UnsupportedInDegradedMode(info.to_string())),
        };
        match self.cache.query_durable(&key).await {
            Ok(body) => {
                tracing::debug!(request=%info, key=%key, "served from local cache");
                Ok(json_response(StatusCode::OK, body))
            }
            Err(e) if e.is_not_found() => Err(ProxyError::NotFoundInCache {
                group: info.api_group.clone(),
                resource: info.resource.clone(),
                name: info.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
