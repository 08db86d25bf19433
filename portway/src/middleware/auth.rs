//! Credential extraction middleware
//!
//! Runs upstream of the pipeline: a `Authorization: Bearer …` header, an
//! `X-API-Key` header, or an `?api_key=` query parameter is validated and
//! the resulting [`Principal`] attached as a request extension. Invalid
//! credentials answer 401 here; requests without credentials continue
//! anonymously and are judged by each route's scope requirements.

use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use crate::error::Result;
use crate::state::AppState;

/// The raw API key a request presented, kept for rate-limit identity
#[derive(Debug, Clone)]
pub struct ApiKeyValue(pub String);

/// Extract a bearer token from the Authorization header
pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Extract an API key from the `X-API-Key` header or `api_key` query param
pub fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(key) = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(key.to_string());
    }

    query.and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("api_key=")
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
    })
}

/// Validate presented credentials and attach the principal
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let query = request.uri().query().map(str::to_string);

    if let Some(token) = extract_bearer(request.headers()) {
        let principal = state.validator().validate_token(&token).await?;
        request.extensions_mut().insert(principal);
    } else if let Some(key) = extract_api_key(request.headers(), query.as_deref()) {
        let principal = state.validator().validate_key(&key).await?;
        request.extensions_mut().insert(ApiKeyValue(key));
        request.extensions_mut().insert(principal);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_extract_bearer() {
        let map = headers(&[("Authorization", "Bearer abc.def.ghi")]);
        assert_eq!(extract_bearer(&map), Some("abc.def.ghi".to_string()));

        let map = headers(&[("Authorization", "Basic dXNlcg==")]);
        assert_eq!(extract_bearer(&map), None);

        assert_eq!(extract_bearer(&HeaderMap::new()), None);
    }

    #[test]
    fn test_extract_api_key_header_wins() {
        let map = headers(&[("X-API-Key", "sk-from-header")]);
        assert_eq!(
            extract_api_key(&map, Some("api_key=sk-from-query")),
            Some("sk-from-header".to_string())
        );
    }

    #[test]
    fn test_extract_api_key_from_query() {
        let map = HeaderMap::new();
        assert_eq!(
            extract_api_key(&map, Some("page=1&api_key=sk-q&size=2")),
            Some("sk-q".to_string())
        );
        assert_eq!(extract_api_key(&map, Some("page=1")), None);
        assert_eq!(extract_api_key(&map, None), None);
    }
}
