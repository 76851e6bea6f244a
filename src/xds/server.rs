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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use hyper::server::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Response, Status, Streaming};
use tracing::{Instrument, debug, info, info_span, warn};

use super::metrics::Metrics;
use super::types::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer, DiscoveryRequest,
    DiscoveryResponse,
};
use super::{DiscoverySession, Error, Generators, Proxy, SessionConfig, SessionState};
use crate::catalog::{MeshCatalog, NamespacedService};
use crate::drain::DrainWatcher;
use crate::identity::{CertificateAuthority, CertificateProvider};
use crate::strng::Strng;

struct SessionEntry {
    service: NamespacedService,
    state: watch::Receiver<SessionState>,
}

type Sessions = Arc<Mutex<HashMap<Strng, SessionEntry>>>;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDump {
    pub proxy_id: Strng,
    pub service: NamespacedService,
    pub state: SessionState,
}

/// Owns the generators and every live proxy session.
pub struct DiscoveryServer<T: CertificateProvider = CertificateAuthority> {
    generators: Arc<Generators<T>>,
    catalog: Arc<MeshCatalog>,
    cfg: SessionConfig,
    metrics: Arc<Metrics>,
    sessions: Sessions,
}

impl<T: CertificateProvider> DiscoveryServer<T> {
    pub fn new(
        generators: Arc<Generators<T>>,
        catalog: Arc<MeshCatalog>,
        cfg: SessionConfig,
        metrics: Arc<Metrics>,
    ) -> DiscoveryServer<T> {
        DiscoveryServer {
            generators,
            catalog,
            cfg,
            metrics,
            sessions: Default::default(),
        }
    }

    pub fn generators(&self) -> &Arc<Generators<T>> {
        &self.generators
    }

    /// Starts a session for `proxy` over an in-process stream. A proxy id may
    /// only have one live session.
    pub fn connect(&self, proxy: Proxy) -> Result<ProxyStream, Error> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&proxy.id) {
            return Err(Error::InvalidRequest(format!(
                "proxy {} is already connected",
                proxy.id
            )));
        }
        let (req_tx, req_rx) = mpsc::channel(self.cfg.stream_buffer);
        let (resp_tx, resp_rx) = mpsc::channel(self.cfg.stream_buffer);
        let session = DiscoverySession::new(
            proxy.clone(),
            self.generators.clone(),
            self.catalog.clone(),
            self.cfg.clone(),
            self.metrics.clone(),
        );
        let state = session.state();
        sessions.insert(
            proxy.id.clone(),
            SessionEntry {
                service: proxy.service.clone(),
                state: state.clone(),
            },
        );
        drop(sessions);
        self.metrics.connected_proxies.inc();

        let registry = self.sessions.clone();
        let metrics = self.metrics.clone();
        let id = proxy.id.clone();
        let task = tokio::spawn(async move {
            let res = session.run(req_rx, resp_tx).await;
            registry.lock().unwrap().remove(&id);
            metrics.connected_proxies.dec();
            res
        });
        Ok(ProxyStream {
            proxy,
            requests: req_tx,
            responses: resp_rx,
            state,
            task,
        })
    }

    pub fn connected(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn sessions(&self) -> Vec<SessionDump> {
        let sessions = self.sessions.lock().unwrap();
        let mut dump: Vec<SessionDump> = sessions
            .iter()
            .map(|(id, entry)| SessionDump {
                proxy_id: id.clone(),
                service: entry.service.clone(),
                state: *entry.state.borrow(),
            })
            .collect();
        dump.sort_by(|a, b| a.proxy_id.cmp(&b.proxy_id));
        dump
    }

    /// Serves the aggregated discovery service over plaintext HTTP/2 until a
    /// drain starts. Open streams are ended with `UNAVAILABLE` on drain.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, drain: DrainWatcher) {
        let addr = listener.local_addr().ok();
        info!(address = ?addr, component = "xds", "listener established");
        let srv = AggregatedDiscoveryServiceServer::new(AdsService {
            server: self,
            drain: drain.clone(),
        });
        let stop = drain.clone().wait_for_drain();
        tokio::pin!(stop);
        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut stop => {
                    info!(component = "xds", "draining, no longer accepting proxies");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept connection: {e}");
                        continue;
                    }
                },
            };
            let srv = srv.clone();
            let drain = drain.clone();
            tokio::spawn(
                async move {
                    let conn = http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(srv));
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
                        debug!("connection closed with error: {e}");
                    }
                }
                .instrument(info_span!("xds_conn", %peer)),
            );
        }
    }
}

/// Bridges gRPC streams onto [`DiscoveryServer::connect`].
struct AdsService<T: CertificateProvider> {
    server: Arc<DiscoveryServer<T>>,
    drain: DrainWatcher,
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

#[async_trait::async_trait]
impl<T: CertificateProvider> AggregatedDiscoveryService for AdsService<T> {
    type StreamAggregatedResourcesStream = ResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: tonic::Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let mut requests = request.into_inner();
        // The first request identifies the proxy.
        let first = requests
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("stream closed before the first request"))?;
        let proxy = Proxy::from_node(first.node.as_ref())?;
        let span = info_span!("xds", proxy = %proxy.id);
        let mut stream = self.server.connect(proxy)?;
        stream.send(first).await?;

        let (tx, rx) = mpsc::channel(self.server.cfg.stream_buffer);
        let drain = self.drain.clone();
        tokio::spawn(
            async move {
                let stop = drain.wait_for_drain();
                tokio::pin!(stop);
                let mut blocker = None;
                loop {
                    tokio::select! {
                        req = requests.next() => match req {
                            Some(Ok(req)) => {
                                // A failed send means the session ended; its
                                // result is reported below.
                                if stream.send(req).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(status)) => {
                                debug!(%status, "request stream failed");
                                break;
                            }
                            None => break,
                        },
                        resp = stream.recv() => match resp {
                            Some(resp) => {
                                if tx.send(Ok(resp)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        b = &mut stop => {
                            debug!("draining, closing stream");
                            blocker = Some(b);
                            break;
                        }
                    }
                }
                let closing = match stream.disconnect().await {
                    Err(e) => Some(Status::from(e)),
                    Ok(()) if blocker.is_some() => {
                        Some(Status::unavailable("control plane is shutting down"))
                    }
                    Ok(()) => None,
                };
                if let Some(status) = closing {
                    info!(%status, "stream closed");
                    let _ = tx.send(Err(status)).await;
                }
                drop(blocker);
            }
            .instrument(span),
        );
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// One proxy's side of an in-process discovery stream.
#[derive(Debug)]
pub struct ProxyStream {
    proxy: Proxy,
    requests: mpsc::Sender<DiscoveryRequest>,
    responses: mpsc::Receiver<DiscoveryResponse>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<Result<(), Error>>,
}

impl ProxyStream {
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub async fn wait_for_state(&mut self, want: SessionState) -> Result<(), Error> {
        self.state
            .wait_for(|s| *s == want)
            .await
            .map(|_| ())
            .map_err(|_| Error::Transport("session dropped".to_string()))
    }

    pub async fn send(&self, req: DiscoveryRequest) -> Result<(), Error> {
        self.requests
            .send(req)
            .await
            .map_err(|_| Error::Transport(format!("session for {} has ended", self.proxy.id)))
    }

    pub async fn recv(&mut self) -> Option<DiscoveryResponse> {
        self.responses.recv().await
    }

    /// Closes the stream and waits for the session to release its resources.
    pub async fn disconnect(self) -> Result<(), Error> {
        let ProxyStream {
            requests,
            responses,
            task,
            ..
        } = self;
        drop(requests);
        drop(responses);
        task.await
            .map_err(|e| Error::Transport(format!("session task failed: {e}")))?
    }
}

/// Binds the discovery listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    Ok(TcpListener::bind(addr).await?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use matches::assert_matches;

    use super::*;
    use crate::catalog::{DefaultPolicy, Service};
    use crate::drain::DrainMode;
    use crate::test_helpers::{ads_client, generators, hello, request};
    use crate::xds::TypeKind;

    fn server() -> Arc<DiscoveryServer<crate::identity::mock::CountingAuthority>> {
        let catalog = Arc::new(MeshCatalog::new(DefaultPolicy::AllowAll));
        catalog
            .update_services(vec![
                Service::new("default", "bookstore"),
                Service::new("default", "bookbuyer"),
            ])
            .unwrap();
        Arc::new(DiscoveryServer::new(
            Arc::new(generators()),
            catalog,
            SessionConfig::default(),
            Arc::new(Metrics::default()),
        ))
    }

    fn buyer(id: &str) -> Proxy {
        Proxy::new(id, NamespacedService::new("default", "bookbuyer"))
    }

    async fn wait_disconnected<T: CertificateProvider>(server: &DiscoveryServer<T>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connected() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn duplicate_proxy_rejected() {
        let server = server();
        let mut first = server.connect(buyer("p1")).unwrap();
        assert_matches!(server.connect(buyer("p1")), Err(Error::InvalidRequest(_)));
        first.wait_for_state(SessionState::Synced).await.unwrap();

        let dump = server.sessions();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].proxy_id, "p1");
        assert_eq!(dump[0].state, SessionState::Synced);
        assert_eq!(server.metrics.connected_proxies.get(), 1);

        first.disconnect().await.unwrap();
        assert_eq!(server.connected(), 0);
        assert_eq!(server.metrics.connected_proxies.get(), 0);
        // The id is free again.
        server.connect(buyer("p1")).unwrap().disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn grpc_stream() {
        let server = server();
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, drain) = crate::drain::new();
        let serving = tokio::spawn(server.clone().serve(listener, drain));

        let (req_tx, req_rx) = mpsc::channel(4);
        req_tx
            .send(hello(TypeKind::Cluster, "grpc-1", "default/bookbuyer"))
            .await
            .unwrap();
        let mut responses = ads_client(addr)
            .stream_aggregated_resources(ReceiverStream::new(req_rx))
            .await
            .unwrap()
            .into_inner();

        let mut kinds = Vec::new();
        for _ in TypeKind::ALL {
            let resp = responses.message().await.unwrap().unwrap();
            kinds.push(TypeKind::from_type_url(&resp.type_url).unwrap());
        }
        assert_eq!(kinds, TypeKind::ALL.to_vec());
        assert_eq!(server.sessions()[0].service.to_string(), "default/bookbuyer");

        // Closing the request side ends the session and the response stream.
        drop(req_tx);
        wait_disconnected(&server).await;
        assert_matches!(responses.message().await, Ok(None));

        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn grpc_requires_node() {
        let server = server();
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_trigger, drain) = crate::drain::new();
        tokio::spawn(server.clone().serve(listener, drain));

        let mut anonymous = request(TypeKind::Cluster, "");
        anonymous.node = None;
        let Err(status) = ads_client(addr)
            .stream_aggregated_resources(tokio_stream::iter(vec![anonymous]))
            .await
        else {
            panic!("a stream without a node must be rejected");
        };
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(server.connected(), 0);
    }

    #[tokio::test]
    async fn drain_ends_open_streams() {
        let server = server();
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, drain) = crate::drain::new();
        let serving = tokio::spawn(server.clone().serve(listener, drain));

        let (req_tx, req_rx) = mpsc::channel(4);
        req_tx
            .send(hello(TypeKind::Cluster, "grpc-2", "default/bookbuyer"))
            .await
            .unwrap();
        let mut responses = ads_client(addr)
            .stream_aggregated_resources(ReceiverStream::new(req_rx))
            .await
            .unwrap()
            .into_inner();
        responses.message().await.unwrap().unwrap();

        let drained = tokio::spawn(trigger.start_drain_and_wait(DrainMode::Graceful));
        let status = loop {
            match responses.message().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("stream ended without a status"),
                Err(status) => break status,
            }
        };
        assert_eq!(status.code(), tonic::Code::Unavailable);
        drop(req_tx);

        tokio::time::timeout(Duration::from_secs(5), drained)
            .await
            .unwrap()
            .unwrap();
        serving.await.unwrap();
        assert_eq!(server.connected(), 0);
    }
}
