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

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::cds::ACCEPT_ALL_WEIGHT;
use super::types::{Address, ClusterLoadAssignment, LbEndpoint, Locality, LocalityLbEndpoints};
use super::{Error, Proxy};
use crate::catalog::{self, Endpoint, NamespacedService, Snapshot};
use crate::strng::Strng;

/// Load assignments for the requested clusters, or for every allowed
/// destination when `names` is empty. Unknown services and services without
/// endpoints produce an empty assignment.
pub fn generate(
    snapshot: &Snapshot,
    proxy: &Proxy,
    names: &[Strng],
) -> Result<Vec<ClusterLoadAssignment>, Error> {
    let clusters: BTreeSet<NamespacedService> = if names.is_empty() {
        snapshot
            .list_allowed_destinations(&proxy.service)
            .iter()
            .map(|svc| svc.namespaced_name())
            .collect()
    } else {
        names
            .iter()
            .map(|n| {
                NamespacedService::from_resource_name(n)
                    .map_err(|e| Error::InvalidRequest(format!("cluster name: {e}")))
            })
            .collect::<Result<_, _>>()?
    };

    let mut assignments = Vec::with_capacity(clusters.len());
    for name in clusters {
        let endpoints = match snapshot.list_endpoints_for_service(&name) {
            Ok(eps) => eps,
            Err(catalog::Error::ServiceNotFound(_)) => {
                debug!(proxy = %proxy.id, service = %name, "unknown service, sending empty assignment");
                Default::default()
            }
            Err(e) => return Err(e.into()),
        };
        assignments.push(assignment(&name, &endpoints));
    }
    Ok(assignments)
}

fn assignment(name: &NamespacedService, endpoints: &[Endpoint]) -> ClusterLoadAssignment {
    // Endpoints arrive sorted, so each zone's list stays sorted too.
    let mut by_zone: BTreeMap<Option<&str>, Vec<LbEndpoint>> = BTreeMap::new();
    for ep in endpoints {
        by_zone
            .entry(ep.locality.as_deref())
            .or_default()
            .push(LbEndpoint::new(
                Address::socket(ep.address.to_string(), ep.port),
                ep.weight.unwrap_or(ACCEPT_ALL_WEIGHT),
            ));
    }
    ClusterLoadAssignment {
        cluster_name: name.resource_name(),
        endpoints: by_zone
            .into_iter()
            .map(|(zone, lb_endpoints)| LocalityLbEndpoints {
                locality: zone.map(|zone| Locality {
                    zone: zone.to_string(),
                    ..Default::default()
                }),
                lb_endpoints,
                ..Default::default()
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use matches::assert_matches;
    use test_case::test_case;

    use super::*;
    use crate::catalog::{DefaultPolicy, MeshCatalog, Service};
    use crate::strng;

    fn ep(addr: &str) -> Endpoint {
        Endpoint::new(addr.parse::<SocketAddr>().unwrap())
    }

    fn catalog() -> MeshCatalog {
        let catalog = MeshCatalog::new(DefaultPolicy::AllowAll);
        catalog
            .update_services(vec![
                Service::new("default", "bookstore"),
                Service::new("default", "bookbuyer"),
            ])
            .unwrap();
        catalog
    }

    #[test]
    fn grouped_by_zone() {
        let catalog = catalog();
        let store = NamespacedService::new("default", "bookstore");
        catalog
            .update_endpoints(
                &store,
                vec![
                    ep("10.0.0.3:80").with_locality("zone-b"),
                    ep("10.0.0.1:80").with_locality("zone-a").with_weight(10),
                    ep("10.0.0.2:80"),
                ],
            )
            .unwrap();
        let proxy = Proxy::new("p1", NamespacedService::new("default", "bookbuyer"));
        let cla = generate(&catalog.snapshot(), &proxy, &[]).unwrap();
        assert_eq!(cla.len(), 1);
        assert_eq!(cla[0].cluster_name, "bookstore.default");
        let groups = &cla[0].endpoints;
        assert_eq!(groups.len(), 3);
        // The zoneless group sorts first.
        assert!(groups[0].locality.is_none());
        assert_eq!(
            groups[0].lb_endpoints[0].load_balancing_weight,
            Some(ACCEPT_ALL_WEIGHT)
        );
        assert_eq!(
            groups[0].lb_endpoints[0].socket_address().unwrap().address,
            "10.0.0.2"
        );
        assert_eq!(groups[1].locality.as_ref().unwrap().zone, "zone-a");
        assert_eq!(groups[1].lb_endpoints[0].load_balancing_weight, Some(10));
        assert_eq!(groups[2].locality.as_ref().unwrap().zone, "zone-b");
    }

    #[test]
    fn empty_and_unknown_services() {
        let catalog = catalog();
        let proxy = Proxy::new("p1", NamespacedService::new("default", "bookbuyer"));
        let cla = generate(
            &catalog.snapshot(),
            &proxy,
            &[strng::new("bookstore.default"), strng::new("missing.default")],
        )
        .unwrap();
        assert_eq!(cla.len(), 2);
        assert_eq!(cla[0].cluster_name, "bookstore.default");
        assert!(cla[0].endpoints.is_empty());
        assert_eq!(cla[1].cluster_name, "missing.default");
        assert!(cla[1].endpoints.is_empty());
    }

    #[test_case("bookstore"; "no namespace")]
    #[test_case("default/bookstore"; "catalog form")]
    #[test_case("Bookstore.default"; "not a dns label")]
    fn malformed_cluster_name(name: &str) {
        let catalog = catalog();
        let proxy = Proxy::new("p1", NamespacedService::new("default", "bookbuyer"));
        assert_matches!(
            generate(&catalog.snapshot(), &proxy, &[strng::new(name)]),
            Err(Error::InvalidRequest(_))
        );
    }
}
