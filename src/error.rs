use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

/// Standard API response envelope: `{"status":200,"message":"OK","data":…}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Builds the success envelope around `data`.
pub fn ok_response<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        status: StatusCode::OK.as_u16(),
        message: "OK".to_string(),
        data: Some(data),
    })
}

/// One validation failure detail in the 400 envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationDetail {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub field: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ValidationDetail {
    pub fn new(code: &str, field: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            field: field.to_string(),
            message: message.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// Unified error type for gateway responses. Only this boundary
/// translates errors into status codes.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(Vec<ValidationDetail>),
    RateLimited,
    Internal(String),
}

impl ApiError {
    pub fn invalid(code: &str, field: &str, message: impl Into<String>) -> Self {
        Self::BadRequest(vec![ValidationDetail::new(code, field, message)])
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(details) => write!(f, "bad_request: {} violation(s)", details.len()),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Internal(msg) => write!(f, "internal_error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, details) = match self {
            Self::BadRequest(details) => (StatusCode::BAD_REQUEST, details),
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                vec![ValidationDetail::new("ERR_RATE_LIMITED", "", "rate limited")],
            ),
            Self::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                vec![ValidationDetail::new("ERR_INTERNAL", "", msg)],
            ),
        };

        let body = ApiResponse {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            data: Some(details),
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_shape() {
        let resp = ok_response(serde_json::json!({"x": 1}));
        let body = serde_json::to_value(&resp.0).unwrap();
        assert_eq!(body["status"], 200);
        assert_eq!(body["message"], "OK");
        assert_eq!(body["data"]["x"], 1);
    }

    #[test]
    fn validation_detail_serializes_sparse() {
        let d = ValidationDetail::new("ERR_REQUIRED", "symbol", "symbol is required");
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["code"], "ERR_REQUIRED");
        assert_eq!(v["field"], "symbol");
        assert!(v.get("params").is_none());
    }
}
