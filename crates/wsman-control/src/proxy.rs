//! Pass-through of routed requests to instances.

use axum::{
    Extension,
    body::Body,
    extract::{State, ws::WebSocketUpgrade},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    response::{Html, IntoResponse, Response},
};

use wsman_model::Caller;

use crate::router::{self, ResolvedRoute};
use crate::state::AppState;
use crate::ws_bridge::{self, BackendTarget};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Headers the WebSocket client request carries over to the backend.
const WS_FORWARDED: &[&str] = &["cookie", "authorization", "sec-websocket-protocol", "origin"];

const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

fn is_hop_by_hop(name: &HeaderName, connection_listed: &[String]) -> bool {
    let name = name.as_str();
    HOP_BY_HOP.contains(&name) || connection_listed.iter().any(|c| c == name)
}

/// Copies end-to-end headers, dropping hop-by-hop ones including those the
/// `Connection` header names.
pub fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_by_hop(name, &connection_listed) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"))
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn unavailable(message: &'static str) -> Response {
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, message).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("3"));
    response
}

/// Fallback handler for every path that is not part of the service's own API.
pub async fn proxy(
    State(state): State<AppState>,
    caller: Option<Extension<Caller>>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    let caller = caller.map(|Extension(c)| c);
    let Some(request) = router::parse(req.uri().path(), req.uri().query()) else {
        return not_found();
    };
    let manager = &state.manager;
    let Some(route) = router::resolve(manager, &request, caller.as_ref()) else {
        tracing::debug!(path = %req.uri().path(), "no route");
        return not_found();
    };

    if !manager.is_ready(&route.instance).await {
        if ws.is_none() && wants_html(req.headers()) {
            let progress = manager.progress(&route.version, &route.instance).await;
            return Html(crate::progress::render_page(&route.version.config.name, &progress)).into_response();
        }
        return unavailable("instance is starting");
    }

    let Some(authority) = router::upstream_authority(manager, &route).await else {
        return unavailable("instance has no address yet");
    };

    match ws {
        Some(ws) => {
            let headers = WS_FORWARDED
                .iter()
                .filter_map(|name| {
                    let value = req.headers().get(*name)?.clone();
                    Some((HeaderName::from_static(*name), value))
                })
                .collect();
            let target = BackendTarget {
                url: format!("ws://{authority}{}", route.path),
                headers,
            };
            let touch = idle_toucher(&state, &route);
            ws_bridge::bridge(ws, target, touch).await
        }
        None => forward(&state, &route, &authority, req).await,
    }
}

fn idle_toucher(state: &AppState, route: &ResolvedRoute) -> impl Fn() + Send + Sync + 'static {
    let manager = state.manager.clone();
    let instance = route.instance.clone();
    let evictable = route.owner.is_idle_evictable();
    move || {
        if evictable {
            manager.registry.idle().touch(&instance);
        }
    }
}

async fn forward(state: &AppState, route: &ResolvedRoute, authority: &str, req: Request<Body>) -> Response {
    let url = format!("http://{authority}{}", route.path);
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(error = %e, "request body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let mut headers = end_to_end_headers(&parts.headers);
    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
    }
    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(instance = %route.instance, error = %e, "upstream request failed");
            state.manager.readiness.put(&route.instance, false);
            return (StatusCode::BAD_GATEWAY, "instance unreachable").into_response();
        }
    };

    let status = upstream.status();
    let headers = end_to_end_headers(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
