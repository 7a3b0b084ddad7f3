use serde::{Deserialize, Serialize};

/// Structured error body returned to API clients, shaped like the
/// control plane's own `Status` object so existing clients can decode it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub kind: String,
    pub api_version: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: String,
    pub message: String,
    pub reason: StatusReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
    pub code: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusReason {
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
    ServiceUnavailable,
    BadGateway,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusDetails {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

impl Status {
    pub fn failure(code: u16, reason: StatusReason, message: impl Into<String>) -> Self {
        Self {
            kind: "Status".to_string(),
            api_version: "v1".to_string(),
            metadata: serde_json::Map::new(),
            status: "Failure".to_string(),
            message: message.into(),
            reason,
            details: None,
            code,
        }
    }

    pub fn with_details(mut self, details: StatusDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::failure(400, StatusReason::BadRequest, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::failure(403, StatusReason::Forbidden, message)
    }

    /// `resource "name" not found`, matching the control plane's wording.
    pub fn not_found(group: &str, resource: &str, name: &str) -> Self {
        let qualified = if group.is_empty() {
            resource.to_string()
        } else {
            format!("{resource}.{group}")
        };
        let message = if name.is_empty() {
            format!("{qualified} not found")
        } else {
            format!("{qualified} \"{name}\" not found")
        };
        Self::failure(404, StatusReason::NotFound, message).with_details(StatusDetails {
            name: name.to_string(),
            group: group.to_string(),
            kind: resource.to_string(),
        })
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::failure(
            500,
            StatusReason::InternalError,
            format!("Internal error occurred: {}", message.into()),
        )
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::failure(502, StatusReason::BadGateway, message)
    }
}
