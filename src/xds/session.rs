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

use std::collections::BTreeMap;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use prost_types::Any;
use textnonce::TextNonce;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, instrument, warn};

use super::metrics::{ConnectionTerminationReason, Metrics, Push, PushOutcome};
use super::types::{DiscoveryRequest, DiscoveryResponse};
use super::{Error, Generators, Proxy, TypeKind};
use crate::catalog::{ChangeKind, MeshCatalog};
use crate::identity::{CertWatch, CertificateProvider};
use crate::metrics::IncrementRecorder;
use crate::strng::{self, Strng};

const INITIAL_PUSH_BACKOFF: Duration = Duration::from_millis(10);
const MAX_PUSH_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// How long a single push may wait on a full stream.
    pub push_timeout: Duration,
    /// Consecutive failed pushes after which the proxy is disconnected.
    pub max_push_failures: u32,
    /// Capacity of the outbound response stream.
    pub stream_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            push_timeout: Duration::from_secs(5),
            max_push_failures: 5,
            stream_buffer: 16,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    Connecting,
    Synced,
    Disconnected,
}

struct Pushed {
    version: u64,
    nonce: Strng,
    resources: Vec<Any>,
}

#[derive(Default)]
struct KindState {
    last: Option<Pushed>,
    /// Requested resource names; only narrows EDS.
    names: Vec<Strng>,
    dirty: bool,
    /// Send even if the generated resources match the last push.
    force: bool,
}

enum Flush {
    Done,
    Retry(Duration),
    Disconnect(ConnectionTerminationReason),
}

/// Streams configuration to one proxy. Each kind keeps the last pushed
/// response; a push only happens when regeneration changes it, or when the
/// proxy asks for state it does not have.
pub struct DiscoverySession<T: CertificateProvider> {
    proxy: Proxy,
    generators: Arc<Generators<T>>,
    catalog: Arc<MeshCatalog>,
    cfg: SessionConfig,
    metrics: Arc<Metrics>,
    state: watch::Sender<SessionState>,
    kinds: BTreeMap<TypeKind, KindState>,
    push_failures: u32,
    backoff: ExponentialBackoff,
}

impl<T: CertificateProvider> DiscoverySession<T> {
    pub fn new(
        proxy: Proxy,
        generators: Arc<Generators<T>>,
        catalog: Arc<MeshCatalog>,
        cfg: SessionConfig,
        metrics: Arc<Metrics>,
    ) -> DiscoverySession<T> {
        let (state, _) = watch::channel(SessionState::Connecting);
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(INITIAL_PUSH_BACKOFF)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(MAX_PUSH_BACKOFF)
            .with_max_elapsed_time(None)
            .build();
        DiscoverySession {
            proxy,
            generators,
            catalog,
            cfg,
            metrics,
            state,
            kinds: TypeKind::ALL
                .into_iter()
                .map(|k| (k, KindState::default()))
                .collect(),
            push_failures: 0,
            backoff,
        }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Runs until the proxy goes away or misbehaves. The catalog subscription
    /// and certificate watch are released before the state turns
    /// `Disconnected`.
    #[instrument(skip_all, name = "xds", fields(proxy = %self.proxy.id, service = %self.proxy.service))]
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<DiscoveryRequest>,
        responses: mpsc::Sender<DiscoveryResponse>,
    ) -> Result<(), Error> {
        let mut changes = self.catalog.subscribe();
        let mut cert = match self
            .proxy
            .service
            .common_name(&self.generators.config().trust_domain)
        {
            Ok(cn) => Some(self.generators.certs().watch(&cn)),
            Err(e) => {
                warn!("service has no valid identity, secrets will not be served: {e}");
                None
            }
        };
        info!("proxy connected");

        for ks in self.kinds.values_mut() {
            ks.dirty = true;
        }
        let mut retry_at: Option<Instant> = None;
        let result = loop {
            if retry_at.is_none_or(|at| Instant::now() >= at) {
                match self.flush(&responses).await {
                    Flush::Done => retry_at = None,
                    Flush::Retry(delay) => retry_at = Some(Instant::now() + delay),
                    Flush::Disconnect(reason) => break Err(reason),
                }
            }

            tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => if let Err(e) = self.handle_request(req) {
                        warn!("closing stream: {e}");
                        break Err(ConnectionTerminationReason::InvalidRequest);
                    },
                    None => break Ok(()),
                },
                Some(change) = changes.recv() => {
                    debug!(generation = change.generation, "catalog changed");
                    self.on_catalog_change(&change.kind);
                }
                _ = cert_changed(&mut cert) => {
                    debug!("certificate changed");
                    self.mark_dirty(TypeKind::Secret);
                }
                _ = retry_timer(retry_at) => {}
            }
        };

        drop(changes);
        drop(cert);
        self.state.send_replace(SessionState::Disconnected);
        let reason = match &result {
            Ok(()) => ConnectionTerminationReason::Closed,
            Err(reason) => *reason,
        };
        self.metrics.increment(&reason);
        info!(?reason, "proxy disconnected");
        match reason {
            ConnectionTerminationReason::Closed => Ok(()),
            ConnectionTerminationReason::InvalidRequest => Err(Error::InvalidRequest(format!(
                "proxy {} sent an invalid request",
                self.proxy.id
            ))),
            ConnectionTerminationReason::PushFailures => Err(Error::Transport(format!(
                "{} consecutive pushes to {} failed",
                self.push_failures, self.proxy.id
            ))),
        }
    }

    fn handle_request(&mut self, req: DiscoveryRequest) -> Result<(), Error> {
        let kind = TypeKind::from_type_url(&req.type_url)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown type {}", req.type_url)))?;
        if let Some(node) = &req.node {
            if !node.id.is_empty() && node.id != self.proxy.id.as_str() {
                return Err(Error::InvalidRequest(format!(
                    "node {} on the stream of {}",
                    node.id, self.proxy.id
                )));
            }
        }
        let Some(ks) = self.kinds.get_mut(&kind) else {
            return Ok(());
        };

        if let Some(status) = &req.error_detail {
            warn!(
                %kind,
                version = %req.version_info,
                nonce = %req.response_nonce,
                "proxy rejected configuration: {}",
                status.message
            );
            self.metrics.increment(&Push {
                kind,
                outcome: PushOutcome::Rejected,
            });
            return Ok(());
        }

        if !req.response_nonce.is_empty() {
            match &ks.last {
                Some(last) if last.nonce == req.response_nonce => {
                    debug!(%kind, version = last.version, "ack");
                }
                _ => debug!(%kind, nonce = %req.response_nonce, "stale nonce"),
            }
        } else if let Some(last) = &ks.last {
            if req.version_info != last.version.to_string() {
                debug!(%kind, have = %req.version_info, "proxy is behind, resending");
                ks.force = true;
            }
        }

        if kind == TypeKind::Endpoint {
            let mut names: Vec<Strng> = req.resource_names.iter().map(strng::new).collect();
            names.sort();
            names.dedup();
            if names != ks.names {
                ks.names = names;
                ks.dirty = true;
            }
        }
        Ok(())
    }

    fn on_catalog_change(&mut self, kind: &ChangeKind) {
        match kind {
            ChangeKind::Services | ChangeKind::Endpoints(_) | ChangeKind::Policies => {
                self.mark_dirty(TypeKind::Cluster);
                self.mark_dirty(TypeKind::Endpoint);
                self.mark_dirty(TypeKind::Route);
            }
        }
    }

    fn mark_dirty(&mut self, kind: TypeKind) {
        if let Some(ks) = self.kinds.get_mut(&kind) {
            ks.dirty = true;
        }
    }

    /// Regenerates every pending kind against one snapshot and pushes what
    /// changed, in kind order.
    async fn flush(&mut self, responses: &mpsc::Sender<DiscoveryResponse>) -> Flush {
        let snapshot = self.catalog.snapshot();
        for kind in TypeKind::ALL {
            let names = match self.kinds.get(&kind) {
                Some(ks) if ks.dirty || ks.force => ks.names.clone(),
                _ => continue,
            };
            let resources = match self
                .generators
                .generate(kind, &self.proxy, &snapshot, &names)
                .await
            {
                Ok(resources) => resources,
                Err(e) => {
                    // Stays dirty; the next trigger retries.
                    warn!(%kind, "generation failed: {e}");
                    self.metrics.increment(&Push {
                        kind,
                        outcome: PushOutcome::GenerationFailed,
                    });
                    continue;
                }
            };
            let Some(ks) = self.kinds.get_mut(&kind) else {
                continue;
            };
            let unchanged = ks
                .last
                .as_ref()
                .is_some_and(|last| last.resources == resources);
            if unchanged && !ks.force {
                ks.dirty = false;
                continue;
            }
            let version = match &ks.last {
                Some(last) if unchanged => last.version,
                Some(last) => last.version + 1,
                None => 1,
            };
            let nonce = strng::new(TextNonce::new().into_string());
            let response = DiscoveryResponse {
                version_info: version.to_string(),
                resources: resources.clone(),
                type_url: kind.type_url(),
                nonce: nonce.to_string(),
                ..Default::default()
            };

            match timeout(self.cfg.push_timeout, responses.send(response)).await {
                Ok(Ok(())) => {
                    debug!(%kind, version, resources = resources.len(), "pushed");
                    ks.last = Some(Pushed {
                        version,
                        nonce,
                        resources,
                    });
                    ks.dirty = false;
                    ks.force = false;
                    self.push_failures = 0;
                    self.backoff.reset();
                    self.metrics.increment(&Push {
                        kind,
                        outcome: PushOutcome::Sent,
                    });
                }
                Ok(Err(_)) => return Flush::Disconnect(ConnectionTerminationReason::Closed),
                Err(_) => {
                    self.push_failures += 1;
                    self.metrics.increment(&Push {
                        kind,
                        outcome: PushOutcome::Timeout,
                    });
                    warn!(%kind, failures = self.push_failures, "push timed out");
                    if self.push_failures >= self.cfg.max_push_failures {
                        return Flush::Disconnect(ConnectionTerminationReason::PushFailures);
                    }
                    let delay = self.backoff.next_backoff().unwrap_or(MAX_PUSH_BACKOFF);
                    return Flush::Retry(delay);
                }
            }
        }

        let synced = self
            .kinds
            .values()
            .all(|ks| ks.last.is_some() && !ks.dirty && !ks.force);
        if synced {
            self.state.send_if_modified(|state| {
                if *state == SessionState::Connecting {
                    *state = SessionState::Synced;
                    true
                } else {
                    false
                }
            });
        }
        Flush::Done
    }
}

async fn cert_changed(cert: &mut Option<CertWatch>) {
    match cert {
        Some(watch) => {
            if watch.changed().await.is_err() {
                future::pending::<()>().await
            }
        }
        None => future::pending().await,
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}
