use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::headers::{cache_control, ceil_secs, etag, if_none_match};
use crate::core::{Core, CoreError, ReadOutcome};
use crate::db::DbError;
use crate::health;

/// HTTP body type for responses
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Request routed from method and path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    Status,
    ReadResource {
        tenant_id: String,
        kind: String,
        class: String,
    },
    WriteResource {
        tenant_id: String,
        kind: String,
        class: String,
    },
    MethodNotAllowed,
    NotFound,
}

impl Route {
    /// Route a request. The endpoint class comes from `?class=`, defaulting
    /// to the resource kind for reads and `write` for writes.
    pub fn parse(method: &Method, path: &str, query: Option<&str>) -> Self {
        let parts: Vec<&str> = path
            .trim_start_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        let class = query.and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("class="))
                .filter(|c| !c.is_empty())
                .map(str::to_string)
        });

        match parts.as_slice() {
            ["healthz"] if *method == Method::GET => Route::Health,
            ["status"] if *method == Method::GET => Route::Status,
            ["healthz"] | ["status"] => Route::MethodNotAllowed,
            ["tenants", tenant, kind] => match *method {
                Method::GET => Route::ReadResource {
                    tenant_id: tenant.to_string(),
                    kind: kind.to_string(),
                    class: class.unwrap_or_else(|| kind.to_string()),
                },
                Method::POST => Route::WriteResource {
                    tenant_id: tenant.to_string(),
                    kind: kind.to_string(),
                    class: class.unwrap_or_else(|| "write".to_string()),
                },
                _ => Route::MethodNotAllowed,
            },
            _ => Route::NotFound,
        }
    }
}

/// HTTP server in front of the core
pub struct ApiServer {
    core: Core,
    listen: String,
}

impl ApiServer {
    /// Create a new server with the given core and listen address
    pub fn new(core: Core, listen: String) -> Self {
        Self { core, listen }
    }

    /// Bind and serve until the process exits
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .context(format!("Invalid listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        let pool = self.core.pool.config();
        info!(
            listen = %addr,
            role = %pool.role,
            max_size = pool.max_size,
            "poolguard listening"
        );

        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    // Filter out benign connection reset errors
                    let err_str = format!("{}", e);
                    if !err_str.contains("connection reset") && !err_str.contains("broken pipe") {
                        error!("Error serving connection from {}: {}", remote_addr, e);
                    }
                }
            });
        }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<Response<BoxBody>, Infallible> {
        let start = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();
        let headers = req.headers().clone();

        let body = if method == Method::POST {
            match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!("Failed to read request body: {}", e);
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        format!("Failed to read request body: {}", e),
                    ));
                }
            }
        } else {
            Bytes::new()
        };

        let response = self
            .dispatch(&method, uri.path(), uri.query(), &headers, body)
            .await;

        debug!(
            method = %method,
            uri = %uri,
            status = response.status().as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "request_completed"
        );
        Ok(response)
    }

    /// Route and answer a request whose body has been read
    pub async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response<BoxBody> {
        match Route::parse(method, path, query) {
            Route::Health => text_response(StatusCode::OK, health::liveness().to_string()),
            Route::Status => json_response(StatusCode::OK, &self.core.status()),
            Route::ReadResource {
                tenant_id,
                kind,
                class,
            } => self.read_resource(&tenant_id, &kind, &class, headers),
            Route::WriteResource {
                tenant_id,
                kind,
                class,
            } => self.write_resource(&tenant_id, &kind, &class, body).await,
            Route::MethodNotAllowed => {
                error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
            }
            Route::NotFound => error_response(StatusCode::NOT_FOUND, "Not found".to_string()),
        }
    }

    fn read_resource(
        &self,
        tenant_id: &str,
        kind: &str,
        class: &str,
        headers: &HeaderMap,
    ) -> Response<BoxBody> {
        let ReadOutcome { resource, throttled } =
            match self.core.read_tenant_resource(tenant_id, kind, class) {
                Ok(outcome) => outcome,
                Err(e) => return self.core_error_response(e),
            };

        let version = resource.payload.version;
        let not_modified = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| if_none_match(v, version))
            .unwrap_or(false);

        let mut response = if not_modified {
            empty_response(StatusCode::NOT_MODIFIED)
        } else {
            json_response(StatusCode::OK, &resource.payload.body)
        };

        let cache = self.core.cache.config();
        let h = response.headers_mut();
        set_header(
            h,
            header::CACHE_CONTROL,
            cache_control(&resource, cache.ttl, cache.stale_while_revalidate),
        );
        set_header(h, header::ETAG, etag(version));
        h.insert(X_CACHE, HeaderValue::from_static(resource.freshness.as_str()));

        if let Some(throttle) = throttled {
            h.insert(X_RATELIMIT_REMAINING, HeaderValue::from(throttle.remaining));
            h.insert(X_RATELIMIT_RESET, HeaderValue::from(ceil_secs(throttle.reset_after)));
        }

        response
    }

    async fn write_resource(
        &self,
        tenant_id: &str,
        kind: &str,
        class: &str,
        body: Bytes,
    ) -> Response<BoxBody> {
        let payload: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {}", e))
            }
        };

        match self
            .core
            .write_tenant_resource(tenant_id, kind, class, &payload)
            .await
        {
            Ok(version) => {
                let mut response =
                    json_response(StatusCode::OK, &serde_json::json!({ "version": version }));
                set_header(response.headers_mut(), header::ETAG, etag(version));
                response
            }
            Err(e) => self.core_error_response(e),
        }
    }

    fn core_error_response(&self, e: CoreError) -> Response<BoxBody> {
        match e {
            CoreError::RateLimited {
                retry_after,
                reset_after,
            } => {
                let mut response =
                    error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded".to_string());
                let h = response.headers_mut();
                h.insert(header::RETRY_AFTER, HeaderValue::from(ceil_secs(retry_after).max(1)));
                h.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
                h.insert(X_RATELIMIT_RESET, HeaderValue::from(ceil_secs(reset_after)));
                response
            }
            CoreError::PoolTimeout { waited } => {
                let mut response = error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!(
                        "Database busy: no connection available within {} ms; the write was not applied",
                        waited.as_millis()
                    ),
                );
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(1u64));
                response
            }
            CoreError::Pool(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            CoreError::Database(DbError::Unreachable(msg)) => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Database unreachable: {}; the write was not applied", msg),
            ),
            CoreError::Database(DbError::Timeout) => error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Database timed out; the write may not have been applied".to_string(),
            ),
            CoreError::Database(e) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            CoreError::InvalidPayload(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        }
    }
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: String) {
    match HeaderValue::from_str(&value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(e) => warn!(header = %name, error = %e, "invalid_header_value"),
    }
}

fn response_with(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<BoxBody> {
    let mut response = Response::new(bytes_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn empty_response(status: StatusCode) -> Response<BoxBody> {
    let mut response = Response::new(bytes_body(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, s: String) -> Response<BoxBody> {
    response_with(status, "text/plain", Bytes::from(s))
}

/// Create an error response
fn error_response(status: StatusCode, message: String) -> Response<BoxBody> {
    text_response(status, message)
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    match serde_json::to_vec(value) {
        Ok(body) => response_with(status, "application/json", Bytes::from(body)),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode response: {}", e),
        ),
    }
}

/// Convert Bytes into a BoxBody
fn bytes_body(b: Bytes) -> BoxBody {
    Full::new(b).map_err(|never| match never {}).boxed()
}
