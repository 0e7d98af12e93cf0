use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use tracing::Instrument;

use wsman_model::Caller;

use crate::request_meta::RequestMeta;
use crate::state::AppState;
use crate::tokens::TokenIssuer;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const FORWARDED_TOKEN_HEADER: &str = "x-forwarded-access-token";
pub const ACCESS_COOKIE_NAME: &str = "access";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

pub fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, axum::Json(ErrorBody { message: message.into() })).into_response()
}

fn header_token<'a>(headers: &'a HeaderMap, name: impl axum::http::header::AsHeaderName) -> Option<&'a str> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_token(headers, axum::http::header::AUTHORIZATION)?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// The first credential present, looked up in order: bearer header,
/// forwarded access token header, access cookie.
pub fn credential(headers: &HeaderMap) -> Option<String> {
    bearer_token(headers)
        .or_else(|| header_token(headers, FORWARDED_TOKEN_HEADER).map(str::to_string))
        .or_else(|| {
            CookieJar::from_headers(headers)
                .get(ACCESS_COOKIE_NAME)
                .map(|c| c.value().trim().to_string())
                .filter(|v| !v.is_empty())
        })
}

pub fn caller_from_headers(tokens: &TokenIssuer, headers: &HeaderMap) -> Option<Caller> {
    let token = credential(headers)?;
    match tokens.validate_access_token(&token) {
        Ok(caller) => Some(caller),
        Err(e) => {
            tracing::debug!(error = %e, "ignoring invalid access token");
            None
        }
    }
}

// Middleware: tag every request with an id, echoed back on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let request_id = header_token(req.headers(), REQUEST_ID_HEADER)
        .filter(|v| v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestMeta {
        request_id: request_id.clone(),
    });

    let span = tracing::info_span!(
        "http",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

// Middleware: resolve the caller once; handlers read `Option<Extension<Caller>>`.
pub async fn authenticate(State(state): State<AppState>, mut req: Request<Body>, next: Next) -> Response {
    if let Some(caller) = caller_from_headers(&state.manager.tokens, req.headers()) {
        req.extensions_mut().insert(caller);
    }
    next.run(req).await
}

pub async fn admin_guard(req: Request<Body>, next: Next) -> Response {
    match req.extensions().get::<Caller>() {
        None => json_error(StatusCode::UNAUTHORIZED, "unauthorized"),
        Some(caller) if !caller.is_admin() => json_error(StatusCode::FORBIDDEN, "admin role required"),
        Some(_) => next.run(req).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, middleware, routing::get};
    use std::time::Duration;
    use tower::ServiceExt;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn credentials_are_looked_up_in_order() {
        assert_eq!(credential(&headers(&[])), None);
        assert_eq!(
            credential(&headers(&[("cookie", "access=c; other=x")])).as_deref(),
            Some("c")
        );
        assert_eq!(
            credential(&headers(&[("cookie", "access=c"), (FORWARDED_TOKEN_HEADER, "f")])).as_deref(),
            Some("f")
        );
        assert_eq!(
            credential(&headers(&[
                ("cookie", "access=c"),
                (FORWARDED_TOKEN_HEADER, "f"),
                ("authorization", "Bearer b"),
            ]))
            .as_deref(),
            Some("b")
        );
        assert_eq!(credential(&headers(&[("authorization", "Basic abc")])), None);
    }

    #[test]
    fn callers_come_from_valid_tokens_only() {
        let tokens = TokenIssuer::new(b"secret", Duration::from_secs(60));
        let token = tokens
            .mint_access_token(&Caller::new("alice").with_role("admin"), Duration::from_secs(60))
            .unwrap();
        let caller = caller_from_headers(&tokens, &headers(&[("authorization", &format!("Bearer {token}"))])).unwrap();
        assert_eq!(caller.user_id, "alice");
        assert!(caller.is_admin());

        let other = TokenIssuer::new(b"other", Duration::from_secs(60));
        assert!(caller_from_headers(&other, &headers(&[("authorization", &format!("Bearer {token}"))])).is_none());
    }

    fn app(caller: Option<Caller>) -> Router {
        let router = Router::new()
            .route("/admin", get(|| async { "ok" }))
            .layer(middleware::from_fn(admin_guard));
        let router = match caller {
            Some(caller) => router.layer(Extension(caller)),
            None => router,
        };
        router.layer(middleware::from_fn(request_id))
    }

    async fn call(app: Router, request_id: Option<&str>) -> Response {
        let mut req = Request::builder().uri("/admin");
        if let Some(id) = request_id {
            req = req.header(REQUEST_ID_HEADER, id);
        }
        app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn admin_guard_checks_the_role() {
        assert_eq!(call(app(None), None).await.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(call(app(Some(Caller::new("bob"))), None).await.status(), StatusCode::FORBIDDEN);
        let ok = call(app(Some(Caller::new("root").with_role("admin"))), Some("req-1")).await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers().get(REQUEST_ID_HEADER).unwrap(), "req-1");
    }

    #[tokio::test]
    async fn request_ids_are_generated_when_missing() {
        let resp = call(app(None), None).await;
        let id = resp.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }
}
