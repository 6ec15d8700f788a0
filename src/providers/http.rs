use reqwest::{Response, StatusCode};
use url::Url;

use super::types::ProviderError;

/// Resolves `path` against a configured API host. A host ending in `/` is taken
/// as the full prefix; otherwise `/v1/` is appended, mirroring how users paste
/// either a bare origin or a versioned base.
pub fn api_url(host: &str, fallback: &str, path: &str) -> Result<String, ProviderError> {
    let host = host.trim();
    let host = if host.is_empty() { fallback } else { host };
    let base = if host.ends_with('/') {
        host.to_string()
    } else if host.ends_with("/v1") {
        format!("{}/", host)
    } else {
        format!("{}/v1/", host)
    };
    let base = Url::parse(&base)
        .map_err(|e| ProviderError::RequestFailed(format!("Invalid API host {}: {}", host, e)))?;
    base.join(path.trim_start_matches('/'))
        .map(String::from)
        .map_err(|e| ProviderError::RequestFailed(format!("Invalid API path {}: {}", path, e)))
}

/// Maps a vendor HTTP status to the shared error taxonomy. `parse_message`
/// extracts the vendor's error text from the body when it has one.
pub async fn ensure_success(
    response: Response,
    parse_message: fn(&str) -> Option<String>,
) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ProviderError::AuthError("Invalid API key".to_string()));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        return Err(ProviderError::RateLimited { retry_after_secs });
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::RequestFailed(format_error(status, &body, parse_message)))
}

pub fn format_error(
    status: StatusCode,
    body: &str,
    parse_message: fn(&str) -> Option<String>,
) -> String {
    match parse_message(body) {
        Some(message) => format!("HTTP {}: {}", status.as_u16(), message),
        None => format!("HTTP {}: Request failed", status.as_u16()),
    }
}

pub fn network_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::NetworkError(format!("Request timed out: {}", e))
    } else {
        ProviderError::NetworkError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_appends_version_to_bare_host() {
        assert_eq!(
            api_url("https://api.openai.com", "", "chat/completions").unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            api_url("http://localhost:1234/v1", "", "/models").unwrap(),
            "http://localhost:1234/v1/models"
        );
    }

    #[test]
    fn test_api_url_trailing_slash_is_full_prefix() {
        assert_eq!(
            api_url("https://example.com/openai/", "", "chat/completions").unwrap(),
            "https://example.com/openai/chat/completions"
        );
    }

    #[test]
    fn test_api_url_uses_fallback_and_rejects_garbage() {
        assert_eq!(
            api_url("", "https://api.anthropic.com", "messages").unwrap(),
            "https://api.anthropic.com/v1/messages"
        );
        assert!(api_url("not a url", "", "messages").is_err());
    }

    #[test]
    fn test_format_error_prefers_vendor_message() {
        fn parse(body: &str) -> Option<String> {
            (!body.is_empty()).then(|| body.to_string())
        }
        assert_eq!(
            format_error(StatusCode::BAD_REQUEST, "bad model", parse),
            "HTTP 400: bad model"
        );
        assert_eq!(
            format_error(StatusCode::BAD_GATEWAY, "", parse),
            "HTTP 502: Request failed"
        );
    }
}
