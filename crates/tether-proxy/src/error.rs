use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tether_common::{Status, StatusDetails};

use crate::body::json_response;
use crate::cache::CacheError;
use crate::filter::FilterError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream request failed ({kind}): {message}")]
    Transport { kind: &'static str, message: String },
    #[error("failed to modify response of {request}: {reason}")]
    ResponseModification { request: String, reason: String },
    #[error("request({0}) is not supported when cluster is unhealthy")]
    UnsupportedInDegradedMode(String),
    #[error("delete request is not supported in local cache")]
    Forbidden { name: String, group: String, kind: String },
    #[error("{resource} not found in local cache")]
    NotFoundInCache {
        group: String,
        resource: String,
        name: String,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ProxyError {
    pub fn modification(request: impl ToString, reason: impl ToString) -> Self {
        ProxyError::ResponseModification {
            request: request.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn from_filter(request: impl ToString, err: FilterError) -> Self {
        Self::modification(request, err)
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Transport { .. } | ProxyError::ResponseModification { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::UnsupportedInDegradedMode(_) | ProxyError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ProxyError::NotFoundInCache { .. } => StatusCode::NOT_FOUND,
            ProxyError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The API `Status` object sent back to the client.
    pub fn to_status(&self) -> Status {
        match self {
            ProxyError::Transport { .. } | ProxyError::ResponseModification { .. } => {
                Status::bad_gateway(self.to_string())
            }
            ProxyError::UnsupportedInDegradedMode(_) | ProxyError::InvalidRequest(_) => {
                Status::bad_request(self.to_string())
            }
            ProxyError::Forbidden { name, group, kind } => {
                Status::forbidden(self.to_string()).with_details(StatusDetails {
                    name: name.clone(),
                    group: group.clone(),
                    kind: kind.clone(),
                })
            }
            ProxyError::NotFoundInCache {
                group,
                resource,
                name,
            } => Status::not_found(group, resource, name),
            ProxyError::Cache(e) => Status::internal_error(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Transport {
            kind: classify_reqwest_error(&e),
            message: e.to_string(),
        }
    }
}

pub(crate) fn classify_reqwest_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        return "timeout";
    }
    if error.is_connect() {
        return "connect";
    }
    "other"
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.to_status();
        let body = serde_json::to_vec(&status).unwrap_or_default();
        json_response(self.status_code(), Bytes::from(body))
    }
}
