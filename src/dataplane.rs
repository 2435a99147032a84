//! HTTP client for the local NAT data plane.
//!
//! The data plane exposes `GET /state` and `PUT /state` over a unix-domain
//! socket. State is never cached here; every call reflects the data plane's
//! current snapshot.

use crate::{
    error::{Error, Result},
    state::NatState,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{client::conn::http1, header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::{path::PathBuf, time::Duration};
use tokio::net::UnixStream;
use tracing::debug;

/// Default per-call deadline for data plane requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the data plane's state API.
#[derive(Debug, Clone)]
pub struct DataPlaneClient {
    socket_path: PathBuf,
    request_timeout: Duration,
}

impl DataPlaneClient {
    /// Create a client for the data plane socket at `socket_path`.
    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path, request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }

    /// Override the per-call deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Fetch the data plane's current NAT state.
    pub async fn get_state(&self) -> Result<NatState> {
        let (status, body) = self.request(Method::GET, "/state", None).await?;
        if status != StatusCode::OK {
            return Err(Error::data_plane(format!("GET /state returned status {status}")));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Replace the data plane's NAT state wholesale.
    pub async fn set_state(&self, state: &NatState) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(state)?);
        let (status, _body) = self.request(Method::PUT, "/state", Some(payload)).await?;
        if status != StatusCode::OK {
            return Err(Error::data_plane(format!("PUT /state returned status {status}")));
        }
        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<(StatusCode, Bytes)> {
        tokio::time::timeout(self.request_timeout, self.request_inner(method, path, body))
            .await
            .map_err(|_| {
                Error::data_plane(format!(
                    "request timed out after {:?} against {}",
                    self.request_timeout,
                    self.socket_path.display()
                ))
            })?
    }

    async fn request_inner(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<(StatusCode, Bytes)> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::data_plane(format!(
                "failed to connect to {}: {e}",
                self.socket_path.display()
            ))
        })?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::data_plane(format!("handshake failed: {e}")))?;

        // Drive the connection until the exchange completes.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "data plane connection closed with error");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "localhost");
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| Error::data_plane(format!("failed to build request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::data_plane(format!("request failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::data_plane(format!("failed to read response body: {e}")))?
            .to_bytes();

        Ok((status, bytes))
    }
}
