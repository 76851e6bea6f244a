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

//! Discovery protocol messages, generated from the Envoy v3 protos vendored
//! under `proto/`. Only the fields the control plane produces or reads are
//! vendored; tags match upstream. None of the messages contain maps, so
//! encoding is deterministic.

use bytes::Bytes;

// We don't control the codegen, so disable any code warnings in the
// proto modules.
#[allow(warnings)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod envoy {
    pub mod config {
        pub mod core {
            pub mod v3 {
                tonic::include_proto!("envoy.config.core.v3");
            }
        }
        pub mod cluster {
            pub mod v3 {
                tonic::include_proto!("envoy.config.cluster.v3");
            }
        }
        pub mod endpoint {
            pub mod v3 {
                tonic::include_proto!("envoy.config.endpoint.v3");
            }
        }
        pub mod route {
            pub mod v3 {
                tonic::include_proto!("envoy.config.route.v3");
            }
        }
    }
    pub mod extensions {
        pub mod transport_sockets {
            pub mod tls {
                pub mod v3 {
                    tonic::include_proto!("envoy.extensions.transport_sockets.tls.v3");
                }
            }
        }
    }
    pub mod service {
        pub mod discovery {
            pub mod v3 {
                tonic::include_proto!("envoy.service.discovery.v3");
            }
        }
    }
}

#[allow(warnings)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod google {
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
}

pub use envoy::config::cluster::v3::Cluster;
pub use envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, DnsLookupFamily, LbPolicy,
};
pub use envoy::config::core::v3::{Address, DataSource, Locality, Node, SocketAddress};
pub use envoy::config::endpoint::v3::{ClusterLoadAssignment, LbEndpoint, LocalityLbEndpoints};
pub use envoy::config::route::v3::{
    HeaderMatcher, Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost,
    WeightedCluster,
};
pub use envoy::extensions::transport_sockets::tls::v3::{
    CertificateValidationContext, Secret, TlsCertificate,
};
pub use envoy::service::discovery::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
pub use envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
pub use envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
pub use google::rpc::Status;

use envoy::config::core::v3::{address, data_source, socket_address};
use envoy::config::endpoint::v3::{Endpoint, lb_endpoint};
use envoy::config::route::v3::{header_matcher, route, route_action, route_match};
use envoy::extensions::transport_sockets::tls::v3::secret;

impl Address {
    pub fn socket(address: impl Into<String>, port: u16) -> Address {
        Address {
            address: Some(address::Address::SocketAddress(SocketAddress {
                address: address.into(),
                port_specifier: Some(socket_address::PortSpecifier::PortValue(port.into())),
                ..Default::default()
            })),
        }
    }

    pub fn socket_address(&self) -> Option<&SocketAddress> {
        match &self.address {
            Some(address::Address::SocketAddress(sa)) => Some(sa),
            None => None,
        }
    }
}

impl SocketAddress {
    pub fn port(&self) -> Option<u32> {
        match self.port_specifier {
            Some(socket_address::PortSpecifier::PortValue(port)) => Some(port),
            _ => None,
        }
    }
}

impl LbEndpoint {
    pub fn new(address: Address, weight: u32) -> LbEndpoint {
        LbEndpoint {
            host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                address: Some(address),
                ..Default::default()
            })),
            load_balancing_weight: Some(weight),
        }
    }

    pub fn socket_address(&self) -> Option<&SocketAddress> {
        match &self.host_identifier {
            Some(lb_endpoint::HostIdentifier::Endpoint(ep)) => {
                ep.address.as_ref().and_then(Address::socket_address)
            }
            _ => None,
        }
    }
}

impl DataSource {
    pub fn inline(bytes: Bytes) -> DataSource {
        DataSource {
            specifier: Some(data_source::Specifier::InlineBytes(bytes)),
        }
    }

    pub fn inline_bytes(&self) -> Option<&Bytes> {
        match &self.specifier {
            Some(data_source::Specifier::InlineBytes(b)) => Some(b),
            _ => None,
        }
    }
}

impl Secret {
    pub fn with_tls_certificate(name: String, chain: Bytes, key: Bytes) -> Secret {
        Secret {
            name,
            r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
                certificate_chain: Some(DataSource::inline(chain)),
                private_key: Some(DataSource::inline(key)),
            })),
        }
    }

    pub fn with_validation_context(name: String, trusted_ca: Bytes) -> Secret {
        Secret {
            name,
            r#type: Some(secret::Type::ValidationContext(
                CertificateValidationContext {
                    trusted_ca: Some(DataSource::inline(trusted_ca)),
                },
            )),
        }
    }

    pub fn tls_certificate(&self) -> Option<&TlsCertificate> {
        match &self.r#type {
            Some(secret::Type::TlsCertificate(tls)) => Some(tls),
            _ => None,
        }
    }

    pub fn validation_context(&self) -> Option<&CertificateValidationContext> {
        match &self.r#type {
            Some(secret::Type::ValidationContext(ctx)) => Some(ctx),
            _ => None,
        }
    }
}

impl Route {
    pub fn to_cluster(name: String, r#match: RouteMatch, action: RouteAction) -> Route {
        Route {
            name,
            r#match: Some(r#match),
            action: Some(route::Action::Route(action)),
        }
    }

    pub fn route_action(&self) -> Option<&RouteAction> {
        match &self.action {
            Some(route::Action::Route(action)) => Some(action),
            None => None,
        }
    }
}

impl RouteMatch {
    pub fn with_prefix(prefix: impl Into<String>) -> RouteMatch {
        RouteMatch {
            path_specifier: Some(route_match::PathSpecifier::Prefix(prefix.into())),
            headers: Vec::new(),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        match &self.path_specifier {
            Some(route_match::PathSpecifier::Prefix(p)) => Some(p),
            _ => None,
        }
    }
}

impl HeaderMatcher {
    pub fn suffix(name: &str, suffix: String) -> HeaderMatcher {
        HeaderMatcher {
            name: name.to_string(),
            header_match_specifier: Some(header_matcher::HeaderMatchSpecifier::SuffixMatch(
                suffix,
            )),
            invert_match: false,
        }
    }
}

impl RouteAction {
    /// All traffic to `cluster`, carrying the route's weight.
    pub fn weighted(cluster: String, weight: u32) -> RouteAction {
        RouteAction {
            cluster_specifier: Some(route_action::ClusterSpecifier::WeightedClusters(
                WeightedCluster {
                    clusters: vec![envoy::config::route::v3::weighted_cluster::ClusterWeight {
                        name: cluster,
                        weight: Some(weight),
                    }],
                },
            )),
        }
    }

    /// The single cluster this action targets and its weight.
    pub fn target(&self) -> Option<(&str, u32)> {
        match &self.cluster_specifier {
            Some(route_action::ClusterSpecifier::WeightedClusters(wc)) => wc
                .clusters
                .first()
                .map(|c| (c.name.as_str(), c.weight.unwrap_or_default())),
            Some(route_action::ClusterSpecifier::Cluster(c)) => Some((c.as_str(), 0)),
            _ => None,
        }
    }
}
