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

use std::cmp::Reverse;

use itertools::Itertools;

use super::cds::ACCEPT_ALL_WEIGHT;
use super::types::{
    HeaderMatcher, Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost,
};
use super::{GeneratorConfig, Proxy};
use crate::catalog::{PolicyAction, Service, Snapshot, TrafficPolicy};

const CATCH_ALL_PREFIX: &str = "/";
const AUTHORITY_HEADER: &str = ":authority";

/// A single route configuration, named `name.namespace` after the proxy's
/// service, with one virtual host per allowed destination. Denied
/// destinations do not appear.
pub fn generate(
    snapshot: &Snapshot,
    proxy: &Proxy,
    cfg: &GeneratorConfig,
) -> Vec<RouteConfiguration> {
    let virtual_hosts = snapshot
        .list_allowed_destinations(&proxy.service)
        .iter()
        .map(|dst| virtual_host(snapshot, proxy, dst, cfg))
        .collect();
    vec![RouteConfiguration {
        name: proxy.service.resource_name(),
        virtual_hosts,
    }]
}

fn virtual_host(
    snapshot: &Snapshot,
    proxy: &Proxy,
    dst: &Service,
    cfg: &GeneratorConfig,
) -> VirtualHost {
    let dst_name = dst.namespaced_name();
    let cluster = dst_name.resource_name();
    let allows: Vec<&TrafficPolicy> = snapshot
        .policies()
        .between(&proxy.service, &dst_name)
        .filter(|p| p.action == PolicyAction::Allow)
        .collect();

    // (prefix, port, route name, weight)
    let mut rules: Vec<(&str, Option<u16>, String, u32)> = allows
        .iter()
        .filter(|p| p.has_predicate())
        .map(|p| {
            (
                p.path_prefix.as_deref().unwrap_or(CATCH_ALL_PREFIX),
                p.port,
                p.name.to_string(),
                p.weight.unwrap_or(ACCEPT_ALL_WEIGHT),
            )
        })
        .collect();
    if rules.is_empty() {
        let weight = allows
            .iter()
            .find_map(|p| p.weight)
            .unwrap_or(ACCEPT_ALL_WEIGHT);
        rules.push((CATCH_ALL_PREFIX, None, cluster.clone(), weight));
    }
    // Most specific match first.
    rules.sort_by(|a, b| {
        (Reverse(a.0.len()), a.0, a.1.is_none(), a.1, &a.2).cmp(&(
            Reverse(b.0.len()),
            b.0,
            b.1.is_none(),
            b.1,
            &b.2,
        ))
    });
    let routes = rules
        .into_iter()
        .map(|(prefix, port, name, weight)| {
            let mut m = RouteMatch::with_prefix(prefix);
            if let Some(port) = port {
                m.headers
                    .push(HeaderMatcher::suffix(AUTHORITY_HEADER, format!(":{port}")));
            }
            Route::to_cluster(name, m, RouteAction::weighted(cluster.clone(), weight))
        })
        .collect();

    let domains = [cluster.clone(), dst.hostname(&cfg.cluster_domain).to_string()]
        .into_iter()
        .unique()
        .collect();

    VirtualHost {
        name: cluster,
        domains,
        routes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DefaultPolicy, MeshCatalog, NamespacedService};
    use crate::strng;
    use crate::test_helpers::generator_config;

    fn allow(name: &str, src: &str, dst: &str) -> TrafficPolicy {
        TrafficPolicy {
            name: strng::new(name),
            source: src.parse().unwrap(),
            destination: dst.parse().unwrap(),
            action: PolicyAction::Allow,
            path_prefix: None,
            port: None,
            weight: None,
        }
    }

    fn setup(default: DefaultPolicy) -> MeshCatalog {
        let catalog = MeshCatalog::new(default);
        catalog
            .update_services(vec![
                Service::new("default", "bookstore"),
                Service::new("default", "bookbuyer"),
                Service::new("default", "bookwarehouse"),
            ])
            .unwrap();
        catalog
    }

    #[test]
    fn routes_from_allow_policies() {
        let catalog = setup(DefaultPolicy::DenyAll);
        let mut books = allow("books", "default/bookbuyer", "default/bookstore");
        books.path_prefix = Some(strng::new("/books"));
        books.weight = Some(70);
        let mut admin = allow("admin", "default/bookbuyer", "default/bookstore");
        admin.path_prefix = Some(strng::new("/books/admin"));
        admin.port = Some(9090);
        catalog.update_policies(vec![books, admin]).unwrap();

        let proxy = Proxy::new("p1", NamespacedService::new("default", "bookbuyer"));
        let rcs = generate(&catalog.snapshot(), &proxy, &generator_config());
        assert_eq!(rcs.len(), 1);
        assert_eq!(rcs[0].name, "bookbuyer.default");
        let vhosts = &rcs[0].virtual_hosts;
        assert_eq!(vhosts.len(), 1);
        let vh = &vhosts[0];
        assert_eq!(vh.name, "bookstore.default");
        assert_eq!(
            vh.domains,
            vec!["bookstore.default", "bookstore.default.svc.cluster.local"]
        );
        let prefixes: Vec<_> = vh
            .routes
            .iter()
            .map(|r| r.r#match.as_ref().unwrap().prefix().unwrap())
            .collect();
        assert_eq!(prefixes, vec!["/books/admin", "/books"]);
        assert_eq!(
            vh.routes[0].r#match.as_ref().unwrap().headers,
            vec![HeaderMatcher::suffix(":authority", ":9090".to_string())]
        );
        assert!(vh.routes[1].r#match.as_ref().unwrap().headers.is_empty());
        assert_eq!(
            vh.routes[1].route_action().unwrap().target(),
            Some(("bookstore.default", 70))
        );
        assert_eq!(
            vh.routes[0].route_action().unwrap().target(),
            Some(("bookstore.default", ACCEPT_ALL_WEIGHT))
        );
    }

    #[test]
    fn catch_all_and_denied_destinations() {
        let catalog = setup(DefaultPolicy::AllowAll);
        let mut deny = allow("no-warehouse", "default/bookbuyer", "default/bookwarehouse");
        deny.action = PolicyAction::Deny;
        catalog.update_policies(vec![deny]).unwrap();

        let proxy = Proxy::new("p1", NamespacedService::new("default", "bookbuyer"));
        let rcs = generate(&catalog.snapshot(), &proxy, &generator_config());
        let vhosts = &rcs[0].virtual_hosts;
        let names: Vec<_> = vhosts.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["bookstore.default"]);
        let routes = &vhosts[0].routes;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].name, "bookstore.default");
        assert_eq!(routes[0].r#match.as_ref().unwrap().prefix(), Some("/"));
        assert_eq!(
            routes[0].route_action().unwrap().target(),
            Some(("bookstore.default", ACCEPT_ALL_WEIGHT))
        );
    }
}
