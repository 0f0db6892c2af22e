//! The Firecracker control-socket HTTP client (spec §6): a local HTTP/1.1
//! API reached over a Unix stream socket. Kept concrete rather than behind
//! a capability trait — hyper's `Incoming`/`Full<Bytes>` body types are
//! awkward to erase behind `dyn`, and the socket is purely an
//! implementation detail of [`super::VmmManager`], never substituted in
//! tests (which instead fake the whole [`super::VmmManager`] boundary).
//! Grounded directly in the teacher's `vmm/process.rs::send_api_request`.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_client_sockets::{HyperUnixConnector, UnixUriExt};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlSocketError {
    #[error("the socket path could not be converted to a request URI")]
    IncorrectSocketUri,
    #[error("building the HTTP request failed: {0}")]
    RequestNotBuilt(http::Error),
    #[error("serializing the request body failed: {0}")]
    SerializeFailed(serde_json::Error),
    #[error("the HTTP connection pool returned an error: {0}")]
    ClientFailed(hyper_util::client::legacy::Error),
    #[error("reading the response body failed: {0}")]
    BodyReadFailed(hyper::Error),
    #[error("request to {route} returned non-2xx status {status}: {body}")]
    NonSuccessStatus {
        route: String,
        status: StatusCode,
        body: String,
    },
}

/// A thin client bound to one Firecracker control socket. One instance per
/// running VM, created once the socket has been confirmed reachable.
pub struct ControlSocketClient {
    socket_path: PathBuf,
    client: Client<HyperUnixConnector, Full<Bytes>>,
}

impl ControlSocketClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::builder(TokioExecutor::new()).build(HyperUnixConnector),
        }
    }

    /// Attempt a single TCP-equivalent connect to the socket, returning
    /// whether it is currently reachable. Used for the Start protocol's
    /// readiness poll (spec §4.5).
    pub async fn try_connect(socket_path: &Path) -> bool {
        tokio::net::UnixStream::connect(socket_path).await.is_ok()
    }

    pub async fn put_json<T: Serialize + Send + Sync>(&self, route: &str, body: &T) -> Result<(), ControlSocketError> {
        let payload = serde_json::to_vec(body).map_err(ControlSocketError::SerializeFailed)?;
        let request = Request::builder()
            .method("PUT")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(ControlSocketError::RequestNotBuilt)?;

        let response = self.send(route, request).await?;
        ensure_success(route, response).await
    }

    async fn send(&self, route: &str, mut request: Request<Full<Bytes>>) -> Result<Response<Incoming>, ControlSocketError> {
        *request.uri_mut() =
            hyper::Uri::unix(&self.socket_path, route).map_err(|_| ControlSocketError::IncorrectSocketUri)?;
        self.client.request(request).await.map_err(ControlSocketError::ClientFailed)
    }
}

async fn ensure_success(route: &str, mut response: Response<Incoming>) -> Result<(), ControlSocketError> {
    let status = response.status();
    if status.is_success() {
        // Drain the body so the connection can be reused by the pool.
        let _ = recv_to_string(&mut response).await;
        return Ok(());
    }

    let body = recv_to_string(&mut response).await.unwrap_or_default();
    Err(ControlSocketError::NonSuccessStatus {
        route: route.to_owned(),
        status,
        body,
    })
}

async fn recv_to_string(response: &mut Response<Incoming>) -> Result<String, ControlSocketError> {
    let mut buf = Vec::new();
    while let Some(frame) = response.frame().await {
        let frame = frame.map_err(ControlSocketError::BodyReadFailed)?;
        if let Ok(bytes) = frame.into_data() {
            buf.extend_from_slice(&bytes);
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
