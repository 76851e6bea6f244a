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

use prost_types::Duration;

use super::types::{
    Address, Cluster, ClusterDiscoveryType, ClusterLoadAssignment, DiscoveryType, DnsLookupFamily,
    LbEndpoint, LbPolicy, LocalityLbEndpoints,
};
use super::{Error, GeneratorConfig, Proxy, TypeKind};
use crate::catalog::{Service, Snapshot};

/// Name of the static cluster pointing at the proxy's own admin listener.
pub const OBSERVABILITY_CLUSTER: &str = "envoy-metrics-cluster";
/// Weight given to endpoints that do not carry one.
pub const ACCEPT_ALL_WEIGHT: u32 = 100;

const LOCALHOST: &str = "127.0.0.1";

/// One strict-DNS cluster per allowed destination, named `name.namespace`,
/// plus the observability cluster, sorted by name.
pub fn generate(
    snapshot: &Snapshot,
    proxy: &Proxy,
    cfg: &GeneratorConfig,
) -> Result<Vec<Cluster>, Error> {
    let connect_timeout = Duration::try_from(cfg.connect_timeout)
        .map_err(|e| Error::Generation(TypeKind::Cluster, e.to_string()))?;
    let mut clusters: Vec<Cluster> = snapshot
        .list_allowed_destinations(&proxy.service)
        .iter()
        .map(|svc| peer_cluster(svc, cfg, connect_timeout.clone()))
        .collect();
    clusters.push(observability_cluster(cfg, connect_timeout));
    clusters.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(clusters)
}

fn peer_cluster(svc: &Service, cfg: &GeneratorConfig, connect_timeout: Duration) -> Cluster {
    let name = svc.namespaced_name().resource_name();
    Cluster {
        alt_stat_name: name.clone(),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32)),
        connect_timeout: Some(connect_timeout),
        lb_policy: LbPolicy::RoundRobin as i32,
        dns_lookup_family: DnsLookupFamily::V4Only as i32,
        respect_dns_ttl: true,
        ignore_health_on_host_removal: true,
        load_assignment: Some(single_host(
            &name,
            &svc.hostname(&cfg.cluster_domain),
            svc.port,
        )),
        name,
    }
}

fn observability_cluster(cfg: &GeneratorConfig, connect_timeout: Duration) -> Cluster {
    Cluster {
        name: OBSERVABILITY_CLUSTER.to_string(),
        alt_stat_name: OBSERVABILITY_CLUSTER.to_string(),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Static as i32)),
        connect_timeout: Some(connect_timeout),
        lb_policy: LbPolicy::RoundRobin as i32,
        dns_lookup_family: DnsLookupFamily::Auto as i32,
        respect_dns_ttl: false,
        ignore_health_on_host_removal: false,
        load_assignment: Some(single_host(
            OBSERVABILITY_CLUSTER,
            LOCALHOST,
            cfg.proxy_admin_port,
        )),
    }
}

fn single_host(cluster: &str, address: &str, port: u16) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: cluster.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            locality: None,
            lb_endpoints: vec![LbEndpoint::new(
                Address::socket(address, port),
                ACCEPT_ALL_WEIGHT,
            )],
            ..Default::default()
        }],
    }
}
