// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::drain::DrainWatcher;
use crate::signal;

pub fn http1_server() -> hyper::server::conn::http1::Builder {
    let mut b = hyper::server::conn::http1::Builder::new();
    b.timer(TokioTimer::new());
    b
}

pub fn empty_response(code: hyper::StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::default());
    *resp.status_mut() = code;
    resp
}

pub fn plaintext_response(code: hyper::StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = code;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    resp
}

pub fn json_response<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(value) {
        Ok(body) => {
            let mut resp = Response::new(Full::new(Bytes::from(body)));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            resp
        }
        Err(e) => plaintext_response(
            hyper::StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to serialize: {e}\n"),
        ),
    }
}

/// A plaintext HTTP/1.1 server that stops accepting when a drain starts,
/// lets open connections finish gracefully, and triggers process shutdown
/// if accepting fails.
pub struct Server<S> {
    name: String,
    addr: SocketAddr,
    listener: TcpListener,
    shutdown_trigger: signal::ShutdownTrigger,
    drain: DrainWatcher,
    state: Arc<S>,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        shutdown_trigger: signal::ShutdownTrigger,
        drain: DrainWatcher,
        s: S,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Server {
            name: name.to_string(),
            addr,
            listener,
            shutdown_trigger,
            drain,
            state: Arc::new(s),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
    {
        let Server {
            name,
            addr,
            listener,
            shutdown_trigger,
            drain,
            state,
        } = self;
        let f = Arc::new(f);
        info!(address = %addr, component = name, "listener established");
        tokio::spawn(async move {
            let stop = drain.clone().wait_for_drain();
            tokio::pin!(stop);
            loop {
                let (stream, remote) = tokio::select! {
                    _ = &mut stop => {
                        info!("starting drain of {name} server");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("serving {name} failed: {e}");
                            shutdown_trigger.shutdown_now().await;
                            break;
                        }
                    },
                };
                let state = state.clone();
                let f = f.clone();
                let drain = drain.clone();
                tokio::spawn(async move {
                    let conn = http1_server()
                        .half_close(true)
                        .header_read_timeout(Duration::from_secs(2))
                        .max_buf_size(8 * 1024)
                        .serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |req| f(state.clone(), req)),
                        );
                    tokio::pin!(conn);
                    let res = tokio::select! {
                        res = conn.as_mut() => res,
                        blocker = drain.wait_for_drain() => {
                            conn.as_mut().graceful_shutdown();
                            let res = conn.await;
                            drop(blocker);
                            res
                        }
                    };
                    if let Err(e) = res {
                        debug!(%remote, "connection closed with error: {e}");
                    }
                });
            }
            info!("{name} server terminated");
        });
    }
}
