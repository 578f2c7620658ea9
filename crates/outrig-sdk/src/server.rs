use std::{convert::Infallible, path::Path, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use outrig_core::{
    config::{Config, ConnectionType},
    error::ErrorEnvelope,
    wire::{HEALTH_ENDPOINT, SHUTDOWN_ENDPOINT},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    endpoint::{error_response, json_response, HttpResponse, Route, Router},
    runtime::{Phase, RuntimeState, ShutdownReason},
    socket::{self, SocketLock},
};

pub(crate) enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl BoundListener {
    async fn accept(&self) -> std::io::Result<Connection> {
        match self {
            BoundListener::Tcp(listener) => listener.accept().await.map(|(s, _)| Connection::Tcp(s)),
            #[cfg(unix)]
            BoundListener::Unix(listener) => {
                listener.accept().await.map(|(s, _)| Connection::Unix(s))
            }
        }
    }
}

/// A listener plus the location line announced for it.
pub(crate) struct Bound {
    pub listener: BoundListener,
    pub location: String,
    pub lock: Option<SocketLock>,
}

pub(crate) async fn bind(config: &Config, socket_dir: &Path) -> Result<Bound> {
    match config.connection_type {
        ConnectionType::Tcp => {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .context("failed to bind tcp listener")?;
            let location = listener.local_addr()?.to_string();
            Ok(Bound {
                listener: BoundListener::Tcp(listener),
                location,
                lock: None,
            })
        }
        #[cfg(unix)]
        ConnectionType::UnixSocket => {
            let path = socket::socket_path_for(socket_dir, &config.id);
            let lock = SocketLock::acquire(path.clone())?;
            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("failed to bind unix socket {}", path.display()))?;
            Ok(Bound {
                listener: BoundListener::Unix(listener),
                location: format!("{}{}", outrig_core::wire::UNIX_SCHEME, path.display()),
                lock: Some(lock),
            })
        }
        #[cfg(not(unix))]
        ConnectionType::UnixSocket => {
            let _ = socket_dir;
            anyhow::bail!("unix sockets are not supported on this platform")
        }
    }
}

/// Accepts until `stop` fires, then lets open connections finish their
/// current request and close.
pub(crate) async fn serve(listener: BoundListener, state: Arc<RuntimeState>, stop: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::debug!("listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(Connection::Tcp(stream)) => {
                    connections.spawn(serve_connection(stream, state.clone(), stop.clone()));
                }
                #[cfg(unix)]
                Ok(Connection::Unix(stream)) => {
                    connections.spawn(serve_connection(stream, state.clone(), stop.clone()));
                }
                Err(err) => tracing::warn!(error = %err, "failed to accept connection"),
            }
        }
    }
    drop(listener);

    while let Some(result) = connections.join_next().await {
        if let Err(err) = result {
            tracing::error!(error = %err, "connection task aborted");
        }
    }
}

async fn serve_connection<S>(stream: S, state: Arc<RuntimeState>, stop: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_request(state, req).await) }
    });
    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = stop.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(err) = result {
        tracing::debug!(error = %err, "connection closed with error");
    }
}

async fn handle_request(state: Arc<RuntimeState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if state.phase() != Phase::Ready {
        metrics::counter!("outrig_plugin_requests_total", "outcome" => "rejected").increment(1);
        let envelope = ErrorEnvelope::new(
            StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            "plugin is shutting down",
        );
        return error_response(&envelope).map(Full::new);
    }

    let _work = state.tracker.begin();
    let span = tracing::debug_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        status = tracing::field::Empty,
    );
    let response = route(&state, req).instrument(span.clone()).await;
    span.record("status", response.status().as_u16());

    let outcome = match response.status() {
        status if status.is_success() => "ok",
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => "not_found",
        _ => "error",
    };
    metrics::counter!("outrig_plugin_requests_total", "outcome" => outcome).increment(1);
    response.map(Full::new)
}

async fn route(state: &RuntimeState, req: Request<Incoming>) -> HttpResponse {
    let path = req.uri().path().to_string();
    match path.as_str() {
        HEALTH_ENDPOINT if req.method() == Method::GET => respond(json_response(
            StatusCode::OK,
            &serde_json::json!({ "status": "ok" }),
        )),
        SHUTDOWN_ENDPOINT if req.method() == Method::POST => {
            state.trigger(ShutdownReason::Endpoint);
            respond(json_response(
                StatusCode::OK,
                &serde_json::json!({ "status": "shutting down" }),
            ))
        }
        HEALTH_ENDPOINT | SHUTDOWN_ENDPOINT => method_not_allowed(&path),
        _ => dispatch(&state.router, req).await,
    }
}

async fn dispatch(router: &Router, req: Request<Incoming>) -> HttpResponse {
    let handler = match router.select(req.method(), req.uri().path()) {
        Route::Found(endpoint) => endpoint.handler(),
        Route::MethodNotAllowed => return method_not_allowed(req.uri().path()),
        Route::NotFound => {
            return error_response(&ErrorEnvelope::new(
                StatusCode::NOT_FOUND.as_u16(),
                format!("no endpoint registered for {}", req.uri().path()),
            ))
        }
    };

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return error_response(&ErrorEnvelope::new(
                StatusCode::BAD_REQUEST.as_u16(),
                format!("failed to read request body: {err}"),
            ))
        }
    };
    respond(handler(Request::from_parts(parts, body)).await)
}

fn respond(result: Result<HttpResponse, ErrorEnvelope>) -> HttpResponse {
    result.unwrap_or_else(|envelope| {
        tracing::debug!(status = envelope.status_code, message = %envelope.message, "handler returned an error");
        error_response(&envelope)
    })
}

fn method_not_allowed(path: &str) -> HttpResponse {
    error_response(&ErrorEnvelope::new(
        StatusCode::METHOD_NOT_ALLOWED.as_u16(),
        format!("method not allowed for {path}"),
    ))
}
