use std::{future::Future, pin::Pin, sync::Arc};

use anyhow::{bail, Result};
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use outrig_core::{
    error::ErrorEnvelope,
    wire::{HEALTH_ENDPOINT, SHUTDOWN_ENDPOINT},
};
use serde::{de::DeserializeOwned, Serialize};

pub type HttpRequest = Request<Bytes>;
pub type HttpResponse = Response<Bytes>;
pub type HandlerResult = Result<HttpResponse, ErrorEnvelope>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub type Handler = Arc<dyn Fn(HttpRequest) -> HandlerFuture + Send + Sync>;

/// A developer-provided endpoint served next to `/healthz` and `/shutdown`.
#[derive(Clone)]
pub struct Endpoint {
    pub method: Method,
    pub path: String,
    handler: Handler,
}

impl Endpoint {
    pub fn new<F, Fut>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            method,
            path: path.into(),
            handler: Arc::new(move |req| Box::pin(handler(req))),
        }
    }

    /// Decodes the JSON body into `Req` and encodes the handler's `Resp`.
    /// An empty body decodes as JSON `null`.
    pub fn json<Req, Resp, F, Fut>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, ErrorEnvelope>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(method, path, move |req: HttpRequest| {
            let handler = handler.clone();
            async move {
                let body = req.into_body();
                let raw: &[u8] = if body.is_empty() { b"null" } else { &body };
                let input: Req = serde_json::from_slice(raw).map_err(|err| {
                    ErrorEnvelope::new(
                        StatusCode::BAD_REQUEST.as_u16(),
                        format!("invalid request body: {err}"),
                    )
                })?;
                let output = handler(input).await?;
                json_response(StatusCode::OK, &output)
            }
        })
    }

    pub(crate) fn handler(&self) -> Handler {
        self.handler.clone()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

pub fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> HandlerResult {
    let encoded = serde_json::to_vec(body).map_err(|err| {
        ErrorEnvelope::new(
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            format!("failed to encode response: {err}"),
        )
    })?;
    Ok(with_json_body(status, Bytes::from(encoded)))
}

pub fn error_response(envelope: &ErrorEnvelope) -> HttpResponse {
    let status =
        StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_vec(envelope)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(b"{\"message\":\"internal error\",\"statusCode\":500}"));
    with_json_body(status, body)
}

fn with_json_body(status: StatusCode, body: Bytes) -> HttpResponse {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

pub(crate) enum Route<'a> {
    Found(&'a Endpoint),
    MethodNotAllowed,
    NotFound,
}

/// Exact method and path matching over the registered endpoints.
#[derive(Debug, Default, Clone)]
pub(crate) struct Router {
    endpoints: Vec<Endpoint>,
}

impl Router {
    pub(crate) fn insert(&mut self, endpoint: Endpoint) -> Result<()> {
        if !endpoint.path.starts_with('/') {
            bail!("endpoint path `{}` must start with `/`", endpoint.path);
        }
        if endpoint.path == HEALTH_ENDPOINT || endpoint.path == SHUTDOWN_ENDPOINT {
            bail!("endpoint path `{}` is reserved", endpoint.path);
        }
        if self
            .endpoints
            .iter()
            .any(|existing| existing.path == endpoint.path && existing.method == endpoint.method)
        {
            bail!(
                "duplicate endpoint `{} {}`",
                endpoint.method,
                endpoint.path
            );
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    pub(crate) fn select(&self, method: &Method, path: &str) -> Route<'_> {
        let mut path_known = false;
        for endpoint in self.endpoints.iter().filter(|e| e.path == path) {
            if &endpoint.method == method {
                return Route::Found(endpoint);
            }
            path_known = true;
        }
        if path_known {
            Route::MethodNotAllowed
        } else {
            Route::NotFound
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.endpoints.len()
    }
}
