use crate::types::ApiError;
use anyhow::Result;
use reqwest::{Response, StatusCode};

/// Maps non-success HTTP responses onto the error taxonomy. Success
/// responses pass through untouched.
pub async fn check_response_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let response_text = response
        .text()
        .await
        .map_err(|e| ApiError::NetworkError(e.to_string()))?;

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit(response_text),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Authentication(response_text),
        StatusCode::BAD_REQUEST => ApiError::InvalidRequest(response_text),
        status if status.is_server_error() => ApiError::ServiceError(response_text),
        status => ApiError::Unknown(format!("Status {}: {}", status, response_text)),
    };

    Err(error.into())
}

/// Joins an endpoint base and a relative path, tolerating stray slashes
/// on either side.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
