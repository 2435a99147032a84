//! Test fixtures: an in-process NAT data plane.
//!
//! Serves the data plane's `GET /state` / `PUT /state` API over a unix
//! socket, backed by an in-memory snapshot. Used by the test suites and
//! handy for driving the daemon on a workstation.

use crate::{error::Result, state::NatState};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::{
    convert::Infallible,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{net::UnixListener, task::JoinHandle};
use tracing::debug;

/// In-process mock of the NAT data plane.
#[derive(Debug)]
pub struct MockDataPlane {
    state: Arc<Mutex<NatState>>,
    puts: Arc<AtomicU64>,
    accept_task: JoinHandle<()>,
}

impl MockDataPlane {
    /// Bind `socket_path` and start serving.
    pub async fn start(socket_path: PathBuf) -> Result<Self> {
        let listener = UnixListener::bind(&socket_path)?;
        let state = Arc::new(Mutex::new(NatState::default()));
        let puts = Arc::new(AtomicU64::new(0));

        let accept_state = state.clone();
        let accept_puts = puts.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        debug!(error = %e, "mock data plane accept failed");
                        continue;
                    },
                };
                let state = accept_state.clone();
                let puts = accept_puts.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        handle_request(request, state.clone(), puts.clone())
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %e, "mock data plane connection error");
                    }
                });
            }
        });

        Ok(Self { state, puts, accept_task })
    }

    /// Current snapshot.
    #[must_use]
    pub fn state(&self) -> NatState {
        self.state.lock().clone()
    }

    /// Replace the snapshot directly.
    pub fn set_state(&self, state: NatState) {
        *self.state.lock() = state;
    }

    /// Number of `PUT /state` requests served.
    #[must_use]
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }
}

impl Drop for MockDataPlane {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_request(
    request: Request<Incoming>,
    state: Arc<Mutex<NatState>>,
    puts: Arc<AtomicU64>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = if method == Method::GET && path == "/state" {
        let snapshot = state.lock().clone();
        match serde_json::to_vec(&snapshot) {
            Ok(body) => json_response(StatusCode::OK, Bytes::from(body)),
            Err(_) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed"),
        }
    } else if method == Method::PUT && path == "/state" {
        match request.into_body().collect().await {
            Ok(collected) => match serde_json::from_slice::<NatState>(&collected.to_bytes()) {
                Ok(new_state) => {
                    *state.lock() = new_state;
                    puts.fetch_add(1, Ordering::Relaxed);
                    plain_response(StatusCode::OK, "ok")
                },
                Err(_) => plain_response(StatusCode::BAD_REQUEST, "invalid state payload"),
            },
            Err(_) => plain_response(StatusCode::BAD_REQUEST, "unreadable body"),
        }
    } else {
        plain_response(StatusCode::NOT_FOUND, "not found")
    };
    Ok(response)
}

fn json_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(body))
        .expect("static response construction cannot fail")
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response construction cannot fail")
}
