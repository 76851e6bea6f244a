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

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tracing::info;

use crate::catalog::MeshCatalog;
use crate::catalog::local::LocalClient;
use crate::identity::{CertificateAuthority, SecretManager};
use crate::metrics::Metrics;
use crate::xds::{DiscoveryServer, Generators};
use crate::{admin, config, drain, readiness, signal, xds};

/// Wires up the control plane: bootstraps the CA (fatal on failure), loads
/// the local catalog, then starts the discovery and admin servers.
pub async fn build(config: Arc<config::Config>) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let metrics = Metrics::from(&mut registry);

    let shutdown = signal::Shutdown::new();
    // Components that want time to finish hold a drain_rx clone; the drain
    // completes once all of them are dropped, or the grace period expires.
    let (drain_tx, drain_rx) = drain::new();

    let ready = readiness::Ready::new();
    let ca_task = ready.register_task("certificate authority");
    let catalog_task = ready.register_task("catalog");

    let certs = SecretManager::new(
        CertificateAuthority::new(config.cert_validity),
        config.secret_manager_config(),
        metrics.identity.clone(),
    );
    certs
        .bootstrap(&config.ca_organization, config.root_cert_validity)
        .context("bootstrap certificate authority")?;
    info!(
        organization = %config.ca_organization,
        expiration = ?certs.client().root_expiration(),
        "certificate authority bootstrapped"
    );
    if let Some(dir) = &config.root_cert_dir {
        let path = certs
            .client()
            .write_root_certificate(dir)
            .await
            .context("write root certificate")?;
        info!(path = %path.display(), "wrote root certificate");
    }
    drop(ca_task);

    let catalog = Arc::new(
        MeshCatalog::new(config.default_traffic_policy).with_trust_domain(&config.trust_domain),
    );
    if let Some(cfg) = config.local_catalog_config.clone() {
        LocalClient {
            cfg,
            catalog: catalog.clone(),
        }
        .run()
        .await
        .context("load local catalog")?;
    }
    drop(catalog_task);

    let generators = Arc::new(Generators::new(certs.clone(), config.generator_config()));
    let discovery = Arc::new(DiscoveryServer::new(
        generators,
        catalog.clone(),
        config.session_config(),
        metrics.xds.clone(),
    ));
    let listener = xds::bind(config.xds_addr)
        .await
        .context("discovery server starts")?;
    let xds_address = listener.local_addr()?;
    tokio::spawn(discovery.clone().serve(listener, drain_rx.clone()));

    let admin_server = admin::Service::new(
        admin::State {
            config: (*config).clone(),
            catalog,
            certs,
            xds: discovery,
            ready,
            registry: Arc::new(registry),
            shutdown_trigger: shutdown.trigger(),
        },
        drain_rx.clone(),
    )
    .await
    .context("admin server starts")?;
    let admin_address = admin_server.address();
    admin_server.spawn();

    Ok(Bound {
        admin_address,
        xds_address,
        shutdown,
        config,
        drain_tx,
    })
}

pub struct Bound {
    pub admin_address: SocketAddr,
    pub xds_address: SocketAddr,

    pub shutdown: signal::Shutdown,
    config: Arc<config::Config>,
    drain_tx: drain::DrainTrigger,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        // Wait for a signal to shutdown from explicit admin shutdown or signal
        self.shutdown.wait().await;
        self.drain_tx
            .drain_with_deadline(self.config.termination_grace_period)
            .await;
        Ok(())
    }
}
