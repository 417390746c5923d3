use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Request, Uri, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

use crate::{error::AppError, services::identity::Identity, state::SharedState};

/// Identity of the caller, `None` for guests on routes that allow them.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub Option<Identity>);

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer token from the `Authorization` header, or the `token` query
/// parameter browsers use for WebSocket upgrades.
fn request_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned());
    header
        .or_else(|| Query::<TokenQuery>::try_from_uri(uri).ok()?.0.token)
        .filter(|token| !token.is_empty())
}

fn resolve(state: &SharedState, req: &Request<Body>) -> Result<Option<Identity>, AppError> {
    let Some(token) = request_token(req.headers(), req.uri()) else {
        return Ok(None);
    };
    state
        .identity()
        .authenticate(&token)
        .map(Some)
        .ok_or_else(|| AppError::Unauthorized("invalid bearer token".into()))
}

/// Reject requests without a valid bearer token and expose the [`Identity`].
pub async fn require_caller(
    State(state): State<SharedState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let identity = resolve(&state, &req)?
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// Resolve an optional bearer token into a [`Caller`]. An unknown token is
/// still rejected.
pub async fn optional_caller(
    State(state): State<SharedState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let identity = resolve(&state, &req)?;
    req.extensions_mut().insert(Caller(identity));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn header_takes_precedence_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        let uri: Uri = "/ws/play?token=from-query".parse().unwrap();
        assert_eq!(
            request_token(&headers, &uri).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            request_token(&HeaderMap::new(), &uri).as_deref(),
            Some("from-query")
        );
    }

    #[test]
    fn blank_or_missing_tokens_are_absent() {
        let uri: Uri = "/ws/play?token=".parse().unwrap();
        assert_eq!(request_token(&HeaderMap::new(), &uri), None);
        let uri: Uri = "/ws/play".parse().unwrap();
        assert_eq!(request_token(&HeaderMap::new(), &uri), None);
    }
}
