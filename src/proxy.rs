//! Reverse proxy: `/live/<username>/<project>/...` forwarded to the
//! creator's local service through its tunnel's real `localhost:<remote_port>`
//! endpoint.

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use log::error;

use crate::error::TunnelError;
use crate::http::HttpState;

fn strip_hop_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

async fn proxy_to_tunnel(
    state: &HttpState,
    username: &str,
    project_name: &str,
    rest: &str,
    req: Request,
) -> Result<Response, TunnelError> {
    let tunnel = state
        .registry
        .get_by_username_project(username, project_name)
        .await
        .ok_or_else(|| TunnelError::TunnelNotFound(format!("{}/{}", username, project_name)))?;

    let mut target = format!("http://127.0.0.1:{}/{}", tunnel.remote_port, rest);
    if let Some(query) = req.uri().query() {
        target.push('?');
        target.push_str(query);
    }

    let method = req.method().clone();
    let headers = strip_hop_headers(req.headers());
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| TunnelError::ProxyTransport(e.to_string()))?;

    let upstream = state
        .proxy_client
        .request(method, &target)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                TunnelError::ProxyTimeout
            } else {
                log_upstream_error(&target, &e);
                TunnelError::ProxyTransport(e.to_string())
            }
        })?;

    let status = upstream.status();
    let response_headers = upstream.headers().clone();
    let content = upstream
        .bytes()
        .await
        .map_err(|e| TunnelError::ProxyTransport(e.to_string()))?;

    state
        .registry
        .update_stats(&tunnel.tunnel_id, content.len() as u64)
        .await
        .ok();

    let mut response = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        response = response.header(name, value);
    }
    Ok(response
        .body(axum::body::Body::from(content))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

async fn proxy_with_rest(
    State(state): State<HttpState>,
    Path((username, project_name, rest)): Path<(String, String, String)>,
    req: Request,
) -> Result<Response, TunnelError> {
    proxy_to_tunnel(&state, &username, &project_name, &rest, req).await
}

async fn proxy_root(
    State(state): State<HttpState>,
    Path((username, project_name)): Path<(String, String)>,
    req: Request,
) -> Result<Response, TunnelError> {
    proxy_to_tunnel(&state, &username, &project_name, "", req).await
}

pub fn routes() -> Router<HttpState> {
    Router::new()
        .route("/live/{username}/{project_name}", any(proxy_root))
        .route("/live/{username}/{project_name}/{*rest}", any(proxy_with_rest))
}

fn log_upstream_error(target: &str, err: &reqwest::Error) {
    error!("proxy request to {} failed: {}", target, err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn strip_hop_headers_drops_host_and_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::HOST, HeaderValue::from_static("example.com"));
        headers.insert(
            axum::http::header::CONTENT_LENGTH,
            HeaderValue::from_static("12"),
        );
        headers.insert("x-custom", HeaderValue::from_static("value"));

        let stripped = strip_hop_headers(&headers);
        assert!(stripped.get(axum::http::header::HOST).is_none());
        assert!(stripped.get(axum::http::header::CONTENT_LENGTH).is_none());
        assert_eq!(stripped.get("x-custom").unwrap(), "value");
    }
}
