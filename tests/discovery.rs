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
use std::time::Duration;

use prost::Message;
use tokio::sync::mpsc;
use tokio::time;
use tokio_stream::wrappers::ReceiverStream;

use smc::catalog::{DefaultPolicy, Endpoint, MeshCatalog, NamespacedService, Service};
use smc::identity::{CertificateAuthority, CommonName, SecretManager, SecretManagerConfig};
use smc::test_helpers::{ads_client, generator_config, hello, initialize_telemetry, test_config};
use smc::xds::metrics::Metrics;
use smc::xds::types::{ClusterLoadAssignment, DiscoveryResponse, Secret};
use smc::xds::{DiscoveryServer, Generators, Proxy, ProxyStream, SessionConfig, SessionState, TypeKind};
use smc::{app, tls};

struct Mesh {
    certs: SecretManager,
    catalog: Arc<MeshCatalog>,
    server: Arc<DiscoveryServer>,
}

fn mesh() -> Mesh {
    let certs = SecretManager::new(
        CertificateAuthority::new(Duration::from_secs(20 * 60)),
        SecretManagerConfig::default(),
        Default::default(),
    );
    certs
        .bootstrap("Azure Mesh", Duration::from_secs(365 * 24 * 60 * 60))
        .unwrap();
    let catalog = Arc::new(MeshCatalog::new(DefaultPolicy::AllowAll));
    catalog
        .update_services(vec![
            Service::new("default", "bookstore"),
            Service::new("default", "bookbuyer"),
            Service::new("default", "sds"),
        ])
        .unwrap();
    let server = Arc::new(DiscoveryServer::new(
        Arc::new(Generators::new(certs.clone(), generator_config())),
        catalog.clone(),
        SessionConfig::default(),
        Arc::new(Metrics::default()),
    ));
    Mesh {
        certs,
        catalog,
        server,
    }
}

fn proxy(id: &str, service: &str) -> Proxy {
    Proxy::new(id, service.parse::<NamespacedService>().unwrap())
}

async fn initial_pass(stream: &mut ProxyStream) -> Vec<DiscoveryResponse> {
    let mut out = Vec::new();
    for _ in TypeKind::ALL {
        out.push(stream.recv().await.unwrap());
    }
    stream.wait_for_state(SessionState::Synced).await.unwrap();
    out
}

async fn assert_quiet(stream: &mut ProxyStream) {
    assert!(
        time::timeout(Duration::from_millis(200), stream.recv())
            .await
            .is_err(),
        "unexpected push"
    );
}

#[tokio::test]
async fn sds_carries_issued_chain_and_root() {
    initialize_telemetry();
    let mesh = mesh();
    let cn: CommonName = "sds.default.azure.mesh".parse().unwrap();
    let issued = mesh.certs.issue_certificate(&cn).await.unwrap();

    let mut stream = mesh.server.connect(proxy("sds-1", "default/sds")).unwrap();
    let pushed = initial_pass(&mut stream).await;
    let sds = &pushed[3];
    assert_eq!(sds.type_url, TypeKind::Secret.type_url());
    let secrets: Vec<Secret> = sds.resources.iter().map(|r| r.to_msg().unwrap()).collect();

    assert_eq!(secrets[0].name, "root-cert-sds.default");
    let trusted_ca = secrets[0]
        .validation_context()
        .and_then(|ctx| ctx.trusted_ca.as_ref())
        .and_then(|ca| ca.inline_bytes());
    assert_eq!(trusted_ca, Some(&mesh.certs.root_certificate().unwrap()));
    assert_eq!(secrets[1].name, "service-cert-sds.default");
    let tls = secrets[1].tls_certificate().unwrap();
    assert_eq!(
        tls.certificate_chain.as_ref().and_then(|c| c.inline_bytes()),
        Some(issued.certificate_chain())
    );
    assert_eq!(
        tls.private_key.as_ref().and_then(|k| k.inline_bytes()),
        Some(issued.private_key())
    );
    stream.disconnect().await.unwrap();
}

#[tokio::test]
async fn bookstore_round_trip() {
    let mesh = mesh();
    let cn: CommonName = "bookstore.azure.mesh".parse().unwrap();
    let cert = mesh.certs.issue_certificate(&cn).await.unwrap();
    assert_eq!(cert.common_name().as_str(), "bookstore.azure.mesh");
    assert!(!cert.private_key().is_empty());

    let root = mesh.certs.root_certificate().unwrap();
    cert.verify(&root).unwrap();
    tls::verify_chain(cert.certificate_chain(), &root).unwrap();

    let rotated = mesh.certs.rotate_certificate(&cn).await.unwrap();
    assert!(rotated.expiration().not_after > cert.expiration().not_after);
    rotated.verify(&root).unwrap();
}

#[tokio::test]
async fn zero_endpoint_change_is_one_push() {
    let mesh = mesh();
    let store: NamespacedService = "default/bookstore".parse().unwrap();
    mesh.catalog
        .update_endpoints(
            &store,
            vec![Endpoint::new("10.0.0.1:8080".parse::<SocketAddr>().unwrap())],
        )
        .unwrap();

    let mut stream = mesh.server.connect(proxy("buyer-1", "default/bookbuyer")).unwrap();
    initial_pass(&mut stream).await;

    mesh.catalog.update_endpoints(&store, vec![]).unwrap();
    let resp = stream.recv().await.unwrap();
    assert_eq!(resp.type_url, TypeKind::Endpoint.type_url());
    assert_eq!(resp.version_info, "2");
    let assignments: Vec<ClusterLoadAssignment> =
        resp.resources.iter().map(|r| r.to_msg().unwrap()).collect();
    let store_cla = assignments
        .iter()
        .find(|a| a.cluster_name == "bookstore.default")
        .unwrap();
    assert!(store_cla.endpoints.is_empty());
    assert_quiet(&mut stream).await;
    stream.disconnect().await.unwrap();
}

#[tokio::test]
async fn disconnect_restores_subscriber_count() {
    let mesh = mesh();
    let _observer = mesh.catalog.subscribe();
    let before = mesh.catalog.subscriber_count();

    let mut stream = mesh.server.connect(proxy("buyer-1", "default/bookbuyer")).unwrap();
    initial_pass(&mut stream).await;
    assert_eq!(mesh.catalog.subscriber_count(), before + 1);
    assert_eq!(mesh.certs.tracked(), 1);

    stream.disconnect().await.unwrap();
    assert_eq!(mesh.catalog.subscriber_count(), before);
    // The session held the only watch on its certificate.
    assert_eq!(mesh.certs.tracked(), 0);
    assert_eq!(mesh.server.connected(), 0);
}

#[tokio::test]
async fn generation_is_deterministic() {
    let mesh = mesh();
    let store: NamespacedService = "default/bookstore".parse().unwrap();
    mesh.catalog
        .update_endpoints(
            &store,
            vec![
                Endpoint::new("10.0.0.2:80".parse::<SocketAddr>().unwrap()).with_locality("b"),
                Endpoint::new("10.0.0.1:80".parse::<SocketAddr>().unwrap()).with_locality("a"),
            ],
        )
        .unwrap();
    let generators = mesh.server.generators();
    let buyer = proxy("buyer-1", "default/bookbuyer");
    let snapshot = mesh.catalog.snapshot();
    for kind in TypeKind::ALL {
        let first = generators.generate(kind, &buyer, &snapshot, &[]).await.unwrap();
        let second = generators.generate(kind, &buyer, &snapshot, &[]).await.unwrap();
        let bytes = |v: &[prost_types::Any]| v.iter().map(|a| a.encode_to_vec()).collect::<Vec<_>>();
        assert_eq!(bytes(&first), bytes(&second), "{kind} output differs");
    }
}

#[tokio::test]
async fn app_serves_proxies_and_shuts_down() {
    initialize_telemetry();
    let mut cfg = test_config();
    cfg.termination_grace_period = Duration::from_secs(1);
    let bound = app::build(Arc::new(cfg)).await.unwrap();

    let (requests, rx) = mpsc::channel(4);
    requests
        .send(hello(TypeKind::Cluster, "grpc-1", "default/bookbuyer"))
        .await
        .unwrap();
    let mut responses = ads_client(bound.xds_address)
        .stream_aggregated_resources(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();
    let first = responses.message().await.unwrap().unwrap();
    assert_eq!(first.type_url, TypeKind::Cluster.type_url());

    // Shutting down ends the open stream with UNAVAILABLE.
    let closed = async {
        loop {
            match responses.message().await {
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(status) => return Some(status.code()),
            }
        }
    };
    let shutdown = bound.shutdown.trigger();
    let (done, _, closed) = tokio::join!(
        time::timeout(Duration::from_secs(5), bound.wait_termination()),
        shutdown.shutdown_now(),
        time::timeout(Duration::from_secs(5), closed)
    );
    done.expect("app shuts down").expect("app exits without error");
    assert_eq!(closed.expect("stream closes"), Some(tonic::Code::Unavailable));
    drop(requests);
}
