//! Host-side wire protocol: one HTTP/1.1 request per call over TCP or a Unix
//! domain socket, the readiness poller and the stdout handshake reader.

use std::{path::PathBuf, time::Duration};

use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConnectionType,
    error::{ErrorEnvelope, WireError},
};

pub const HEALTH_ENDPOINT: &str = "/healthz";
pub const SHUTDOWN_ENDPOINT: &str = "/shutdown";
pub const UNIX_SCHEME: &str = "http+unix://";

pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum Target {
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

/// Transport handle for one plugin location.
#[derive(Debug, Clone)]
pub struct WireClient {
    connection_type: ConnectionType,
    location: String,
    target: Target,
    timeout: Duration,
}

/// Selects what a call sends. Responses are decoded by [`WireClient::call_json`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    payload: Option<Bytes>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload<T: Serialize + ?Sized>(mut self, payload: &T) -> Result<Self, WireError> {
        let body = serde_json::to_vec(payload).map_err(WireError::Encode)?;
        self.payload = Some(Bytes::from(body));
        Ok(self)
    }

    pub fn with_raw_payload(mut self, body: impl Into<Bytes>) -> Self {
        self.payload = Some(body.into());
        self
    }
}

impl WireClient {
    /// Builds a client for `location` as reported by a plugin handshake.
    ///
    /// TCP locations are `host:port`; Unix locations are `http+unix://<path>`,
    /// any URL whose path is the socket file, or a bare absolute path.
    pub fn new(connection_type: ConnectionType, location: &str) -> Result<Self, WireError> {
        let target = match connection_type {
            ConnectionType::Tcp => Target::Tcp(parse_tcp_location(location)?),
            #[cfg(unix)]
            ConnectionType::UnixSocket => Target::Unix(parse_socket_location(location)?),
            #[cfg(not(unix))]
            ConnectionType::UnixSocket => {
                return Err(WireError::UnsupportedConnectionType(
                    connection_type.to_string(),
                ))
            }
        };
        Ok(Self {
            connection_type,
            location: location.to_string(),
            target,
            timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub async fn ping(&self) -> Result<(), WireError> {
        self.call(HEALTH_ENDPOINT, Method::GET, CallOptions::new())
            .await
            .map(|_| ())
    }

    /// Issues exactly one request and returns the raw response body on 2xx.
    pub async fn call(
        &self,
        endpoint: &str,
        method: Method,
        options: CallOptions,
    ) -> Result<Bytes, WireError> {
        let request = self.build_request(endpoint, method, options)?;
        let (status, body) = tokio::time::timeout(self.timeout, self.send(request))
            .await
            .map_err(|_| {
                WireError::Transport(format!(
                    "request to {endpoint} timed out after {:?}",
                    self.timeout
                ))
            })??;

        if status.is_success() {
            return Ok(body);
        }
        match serde_json::from_slice::<ErrorEnvelope>(&body) {
            Ok(envelope) => Err(WireError::Remote {
                status: status.as_u16(),
                message: envelope.message,
            }),
            Err(_) => Err(WireError::Transport(format!(
                "unexpected status {status} from {endpoint}"
            ))),
        }
    }

    /// Like [`WireClient::call`] but decodes the response body as JSON.
    pub async fn call_json<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: Method,
        options: CallOptions,
    ) -> Result<R, WireError> {
        let body = self.call(endpoint, method, options).await?;
        serde_json::from_slice(&body).map_err(WireError::Decode)
    }

    fn build_request(
        &self,
        endpoint: &str,
        method: Method,
        options: CallOptions,
    ) -> Result<Request<Full<Bytes>>, WireError> {
        let path = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{endpoint}")
        };
        let authority = match &self.target {
            Target::Tcp(addr) => addr.as_str(),
            #[cfg(unix)]
            Target::Unix(_) => "localhost",
        };
        Request::builder()
            .method(method)
            .uri(format!("http://{authority}{path}"))
            .header(header::HOST, authority)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(options.payload.unwrap_or_default()))
            .map_err(WireError::transport)
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<(StatusCode, Bytes), WireError> {
        match &self.target {
            Target::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .map_err(WireError::transport)?;
                exchange(stream, request).await
            }
            #[cfg(unix)]
            Target::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(WireError::transport)?;
                exchange(stream, request).await
            }
        }
    }
}

async fn exchange<S>(stream: S, request: Request<Full<Bytes>>) -> Result<(StatusCode, Bytes), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(WireError::transport)?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "plugin connection closed with error");
        }
    });
    let response = sender
        .send_request(request)
        .await
        .map_err(WireError::transport)?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(WireError::transport)?
        .to_bytes();
    Ok((status, body))
}

fn parse_tcp_location(location: &str) -> Result<String, WireError> {
    let invalid = |reason: &str| WireError::InvalidLocation {
        location: location.to_string(),
        reason: reason.to_string(),
    };
    let authority = location
        .parse::<http::uri::Authority>()
        .map_err(|err| invalid(&err.to_string()))?;
    if authority.host().is_empty() {
        return Err(invalid("missing host"));
    }
    if authority.port_u16().is_none() {
        return Err(invalid("missing port"));
    }
    Ok(authority.as_str().to_string())
}

#[cfg(unix)]
fn parse_socket_location(location: &str) -> Result<PathBuf, WireError> {
    let invalid = |reason: String| WireError::InvalidLocation {
        location: location.to_string(),
        reason,
    };
    let path = if let Some(rest) = location.strip_prefix(UNIX_SCHEME) {
        rest.to_string()
    } else if location.starts_with('/') {
        location.to_string()
    } else {
        url::Url::parse(location)
            .map_err(|err| invalid(err.to_string()))?
            .path()
            .to_string()
    };
    if path.is_empty() || path == "/" {
        return Err(invalid("missing socket path".to_string()));
    }
    Ok(PathBuf::from(path))
}

/// Polls `GET /healthz` until it succeeds, the ceiling passes or `cancel` fires.
pub async fn wait_until_ready(
    client: &WireClient,
    cancel: &CancellationToken,
) -> Result<(), WireError> {
    wait_until_ready_within(client, cancel, READY_POLL_INTERVAL, READY_TIMEOUT).await
}

pub async fn wait_until_ready_within(
    client: &WireClient,
    cancel: &CancellationToken,
    interval: Duration,
    ceiling: Duration,
) -> Result<(), WireError> {
    let poll = async {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match client.ping().await {
                Ok(()) => return,
                Err(err) => tracing::trace!(location = client.location(), error = %err, "plugin not ready yet"),
            }
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WireError::Cancelled),
        _ = tokio::time::sleep(ceiling) => Err(WireError::Timeout(ceiling)),
        _ = poll => Ok(()),
    }
}

/// Reads the first line of a plugin's stdout as its connection location.
pub async fn read_location<R>(reader: &mut R) -> Result<String, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|err| WireError::Handshake(format!("failed to read plugin location: {err}")))?;
    if read == 0 {
        return Err(WireError::Handshake(
            "plugin did not output connection location".to_string(),
        ));
    }
    let location = line.trim();
    if location.is_empty() {
        return Err(WireError::Handshake("plugin output empty location".to_string()));
    }
    Ok(location.to_string())
}

/// First half of the handshake: the location line, bounded by the readiness
/// ceiling. The caller owns `stdout` afterwards and must keep draining it.
pub async fn await_location<R>(stdout: &mut R, cancel: &CancellationToken) -> Result<String, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let location = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(WireError::Cancelled),
        read = tokio::time::timeout(READY_TIMEOUT, read_location(stdout)) => {
            read.map_err(|_| WireError::Timeout(READY_TIMEOUT))??
        }
    };
    tracing::debug!(%location, "plugin reported location");
    Ok(location)
}

/// Second half: build the client for `location` and wait for readiness.
/// Never retried; any failure here discards the candidate.
pub async fn connect(
    connection_type: ConnectionType,
    location: &str,
    cancel: &CancellationToken,
) -> Result<WireClient, WireError> {
    let client = WireClient::new(connection_type, location)?;
    wait_until_ready(&client, cancel).await?;
    Ok(client)
}
