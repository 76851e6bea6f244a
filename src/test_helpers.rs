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
use std::sync::Once;
use std::time::Duration;

use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::config::{self, ControlPlaneConfig};
use crate::identity::mock::{CountingAuthority, new_secret_manager};
use crate::strng;
use crate::xds::types::{AggregatedDiscoveryServiceClient, DiscoveryRequest, Node};
use crate::xds::{GeneratorConfig, Generators, TypeKind};

static TRACING: Once = Once::new();

pub fn initialize_telemetry() {
    TRACING.call_once(crate::telemetry::setup_logging);
}

/// Defaults with every listener on localhost and an ephemeral port.
pub fn test_config() -> config::Config {
    let mut cfg = config::construct_config(ControlPlaneConfig::default())
        .unwrap_or_else(|e| panic!("default config: {e}"));
    cfg.xds_addr = "127.0.0.1:0".parse().unwrap();
    cfg.admin_addr = "127.0.0.1:0".parse().unwrap();
    cfg.trust_domain = strng::literal!("azure.mesh");
    cfg.cluster_domain = strng::literal!("cluster.local");
    cfg.local_catalog_config = None;
    cfg.root_cert_dir = None;
    cfg
}

pub fn generator_config() -> GeneratorConfig {
    GeneratorConfig {
        trust_domain: strng::literal!("azure.mesh"),
        cluster_domain: strng::literal!("cluster.local"),
        proxy_admin_port: 15000,
        connect_timeout: Duration::from_secs(1),
    }
}

/// Generators backed by a bootstrapped in-memory authority issuing one hour leaves.
pub fn generators() -> Generators<CountingAuthority> {
    Generators::new(
        new_secret_manager(Duration::from_secs(60 * 60)),
        generator_config(),
    )
}

/// A bare request for `kind` from the proxy with `node_id`.
pub fn request(kind: TypeKind, node_id: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        node: Some(Node {
            id: node_id.to_string(),
            ..Default::default()
        }),
        type_url: kind.type_url(),
        ..Default::default()
    }
}

/// The request a proxy fronting `service` (`namespace/name`) opens its stream with.
pub fn hello(kind: TypeKind, node_id: &str, service: &str) -> DiscoveryRequest {
    let mut req = request(kind, node_id);
    if let Some(node) = req.node.as_mut() {
        node.cluster = service.to_string();
    }
    req
}

pub type AdsClient = AggregatedDiscoveryServiceClient<Client<HttpConnector, tonic::body::Body>>;

/// A plaintext HTTP/2 aggregated discovery client for the server at `addr`.
pub fn ads_client(addr: SocketAddr) -> AdsClient {
    let client = Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build_http();
    let origin = format!("http://{addr}")
        .parse()
        .unwrap_or_else(|e| panic!("origin for {addr}: {e}"));
    AggregatedDiscoveryServiceClient::with_origin(client, origin)
}
