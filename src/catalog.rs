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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::strng::{self, Strng};

pub mod local;
mod policy;
mod service;

pub use policy::*;
pub use service::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("service not found: {0}")]
    ServiceNotFound(NamespacedService),
    #[error("invalid catalog update: {0}")]
    InvalidState(String),
}

/// What part of the catalog an update replaced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeKind {
    Services,
    Endpoints(NamespacedService),
    Policies,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogChange {
    pub kind: ChangeKind,
    /// Generation of the snapshot the change produced.
    pub generation: u64,
}

/// An immutable view of the catalog. Updates never mutate a snapshot that has
/// been handed out; they build a new one and swap it in.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub generation: u64,
    default_policy: DefaultPolicy,
    services: BTreeMap<NamespacedService, Arc<Service>>,
    // May hold endpoints for services that do not exist (yet).
    endpoints: BTreeMap<NamespacedService, Arc<[Endpoint]>>,
    policies: PolicyStore,
}

impl Snapshot {
    pub fn default_policy(&self) -> DefaultPolicy {
        self.default_policy
    }

    pub fn service(&self, name: &NamespacedService) -> Option<&Arc<Service>> {
        self.services.get(name)
    }

    /// All services, ordered by namespaced name.
    pub fn services(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.values()
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    /// Endpoints of a known service, ordered by address then port. A known
    /// service without endpoints yields an empty list.
    pub fn list_endpoints_for_service(
        &self,
        name: &NamespacedService,
    ) -> Result<Arc<[Endpoint]>, Error> {
        if !self.services.contains_key(name) {
            return Err(Error::ServiceNotFound(name.clone()));
        }
        Ok(self
            .endpoints
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new())))
    }

    /// Services `source` may send traffic to, ordered by namespaced name. A
    /// service is never its own destination.
    pub fn list_allowed_destinations(&self, source: &NamespacedService) -> Vec<Arc<Service>> {
        self.services
            .iter()
            .filter(|(name, _)| *name != source)
            .filter(|(name, _)| self.policies.allows(self.default_policy, source, name))
            .map(|(_, svc)| svc.clone())
            .collect()
    }

    /// Number of services with endpoints reported before the service itself.
    pub fn staged_endpoints(&self) -> usize {
        self.endpoints
            .keys()
            .filter(|k| !self.services.contains_key(*k))
            .count()
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<CatalogChange>>,
}

/// A live registration for catalog change notifications. Dropping it
/// unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<CatalogChange>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<CatalogChange> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CatalogChange> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.lock().unwrap().senders.remove(&self.id);
    }
}

/// The mesh's view of services, their endpoints and the policies between them.
pub struct MeshCatalog {
    current: RwLock<Arc<Snapshot>>,
    // Serializes writers; readers only ever touch `current`.
    writer: Mutex<()>,
    subscribers: Arc<Mutex<Subscribers>>,
    // When set, every service named by an update must map to a valid
    // certificate identity under it.
    trust_domain: Option<Strng>,
}

impl MeshCatalog {
    pub fn new(default_policy: DefaultPolicy) -> MeshCatalog {
        MeshCatalog {
            current: RwLock::new(Arc::new(Snapshot {
                default_policy,
                ..Default::default()
            })),
            writer: Mutex::new(()),
            subscribers: Default::default(),
            trust_domain: None,
        }
    }

    pub fn with_trust_domain(mut self, trust_domain: impl AsRef<str>) -> MeshCatalog {
        self.trust_domain = Some(strng::new(trust_domain));
        self
    }

    fn trust_domain(&self) -> Option<&str> {
        self.trust_domain.as_deref()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().unwrap().clone()
    }

    pub fn list_endpoints_for_service(
        &self,
        name: &NamespacedService,
    ) -> Result<Arc<[Endpoint]>, Error> {
        self.snapshot().list_endpoints_for_service(name)
    }

    pub fn list_allowed_destinations(&self, source: &NamespacedService) -> Vec<Arc<Service>> {
        self.snapshot().list_allowed_destinations(source)
    }

    /// Replaces the full set of services.
    pub fn update_services(&self, services: Vec<Service>) -> Result<u64, Error> {
        let mut next = BTreeMap::new();
        for svc in services {
            svc.validate(self.trust_domain())
                .map_err(Error::InvalidState)?;
            let name = svc.namespaced_name();
            if next.insert(name.clone(), Arc::new(svc)).is_some() {
                return Err(Error::InvalidState(format!("duplicate service {name}")));
            }
        }
        self.apply(ChangeKind::Services, move |snapshot| {
            snapshot.services = next;
        })
    }

    /// Replaces the endpoints of one service. The service need not exist yet.
    pub fn update_endpoints(
        &self,
        service: &NamespacedService,
        mut endpoints: Vec<Endpoint>,
    ) -> Result<u64, Error> {
        service
            .validate_identity(self.trust_domain())
            .map_err(Error::InvalidState)?;
        let mut seen = HashSet::with_capacity(endpoints.len());
        for ep in &endpoints {
            ep.validate().map_err(Error::InvalidState)?;
            if !seen.insert(ep.socket_addr()) {
                return Err(Error::InvalidState(format!(
                    "duplicate endpoint {} for {service}",
                    ep.socket_addr()
                )));
            }
        }
        endpoints.sort_by_key(|ep| (ep.address, ep.port));
        let key = service.clone();
        self.apply(ChangeKind::Endpoints(service.clone()), move |snapshot| {
            if endpoints.is_empty() {
                snapshot.endpoints.remove(&key);
            } else {
                snapshot.endpoints.insert(key, endpoints.into());
            }
        })
    }

    /// Replaces the full set of traffic policies.
    pub fn update_policies(&self, policies: Vec<TrafficPolicy>) -> Result<u64, Error> {
        let store = PolicyStore::from_policies(policies, self.trust_domain())
            .map_err(Error::InvalidState)?;
        self.apply(ChangeKind::Policies, move |snapshot| {
            snapshot.policies = store;
        })
    }

    fn apply(&self, kind: ChangeKind, f: impl FnOnce(&mut Snapshot)) -> Result<u64, Error> {
        let _writer = self.writer.lock().unwrap();
        let mut next = Snapshot::clone(&self.current.read().unwrap());
        f(&mut next);
        next.generation += 1;
        let generation = next.generation;
        *self.current.write().unwrap() = Arc::new(next);
        debug!(?kind, generation, "applied catalog update");
        // Notify while still holding the writer lock so subscribers observe
        // changes in generation order.
        self.notify(CatalogChange { kind, generation });
        Ok(generation)
    }

    fn notify(&self, change: CatalogChange) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.senders
            .retain(|_, tx| tx.send(change.clone()).is_ok());
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().unwrap();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.senders.insert(id, tx);
        info!(id, "catalog subscriber added");
        Subscription {
            id,
            rx,
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().senders.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use matches::assert_matches;

    use super::*;

    fn svc(ns: &str, name: &str) -> Service {
        Service::new(ns, name)
    }

    fn ep(addr: &str) -> Endpoint {
        Endpoint::new(addr.parse::<SocketAddr>().unwrap())
    }

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

    #[test]
    fn endpoints_sorted_and_replaced() {
        let catalog = MeshCatalog::new(DefaultPolicy::DenyAll);
        let name = NamespacedService::new("default", "bookstore");
        catalog.update_services(vec![svc("default", "bookstore")]).unwrap();
        catalog
            .update_endpoints(&name, vec![ep("10.0.0.2:80"), ep("10.0.0.1:8080"), ep("10.0.0.1:80")])
            .unwrap();
        let got: Vec<_> = catalog
            .list_endpoints_for_service(&name)
            .unwrap()
            .iter()
            .map(|e| e.socket_addr().to_string())
            .collect();
        assert_eq!(got, vec!["10.0.0.1:80", "10.0.0.1:8080", "10.0.0.2:80"]);

        catalog.update_endpoints(&name, vec![]).unwrap();
        assert!(catalog.list_endpoints_for_service(&name).unwrap().is_empty());
    }

    #[test]
    fn unknown_service() {
        let catalog = MeshCatalog::new(DefaultPolicy::DenyAll);
        assert_matches!(
            catalog.list_endpoints_for_service(&NamespacedService::new("default", "nope")),
            Err(Error::ServiceNotFound(_))
        );
    }

    #[test]
    fn staged_endpoints_become_visible() {
        let catalog = MeshCatalog::new(DefaultPolicy::DenyAll);
        let name = NamespacedService::new("default", "bookstore");
        catalog.update_endpoints(&name, vec![ep("10.0.0.1:80")]).unwrap();
        assert_eq!(catalog.snapshot().staged_endpoints(), 1);
        assert!(catalog.list_endpoints_for_service(&name).is_err());
        catalog.update_services(vec![svc("default", "bookstore")]).unwrap();
        assert_eq!(catalog.list_endpoints_for_service(&name).unwrap().len(), 1);
        assert_eq!(catalog.snapshot().staged_endpoints(), 0);
    }

    #[test]
    fn invalid_updates_leave_state_untouched() {
        let catalog = MeshCatalog::new(DefaultPolicy::DenyAll);
        let name = NamespacedService::new("default", "bookstore");
        catalog.update_services(vec![svc("default", "bookstore")]).unwrap();
        catalog.update_endpoints(&name, vec![ep("10.0.0.1:80")]).unwrap();
        let before = catalog.snapshot();

        assert_matches!(
            catalog.update_services(vec![svc("default", "a"), svc("default", "a")]),
            Err(Error::InvalidState(_))
        );
        assert_matches!(
            catalog.update_services(vec![svc("default", "a").with_port(0)]),
            Err(Error::InvalidState(_))
        );
        assert_matches!(
            catalog.update_endpoints(&name, vec![ep("10.0.0.1:80"), ep("10.0.0.1:80")]),
            Err(Error::InvalidState(_))
        );
        assert_matches!(
            catalog.update_endpoints(&name, vec![ep("10.0.0.1:80").with_weight(0)]),
            Err(Error::InvalidState(_))
        );
        let mut deny = allow("d", "default/a", "default/bookstore");
        deny.action = PolicyAction::Deny;
        deny.path_prefix = Some(strng::new("/admin"));
        assert_matches!(catalog.update_policies(vec![deny]), Err(Error::InvalidState(_)));

        let after = catalog.snapshot();
        assert_eq!(after.generation, before.generation);
        assert_eq!(after.services().count(), 1);
        assert_eq!(catalog.list_endpoints_for_service(&name).unwrap().len(), 1);
    }

    #[test]
    fn names_must_map_to_identities() {
        let catalog = MeshCatalog::new(DefaultPolicy::DenyAll).with_trust_domain("azure.mesh");
        assert_matches!(
            catalog.update_services(vec![svc("default", "Book_Store")]),
            Err(Error::InvalidState(_))
        );
        // Valid labels, but `<name>.default.azure.mesh` exceeds 64 bytes.
        let long = "b".repeat(50);
        assert_matches!(
            catalog.update_services(vec![svc("default", &long)]),
            Err(Error::InvalidState(_))
        );
        assert_matches!(
            catalog.update_endpoints(
                &NamespacedService::new("default", &long),
                vec![ep("10.0.0.1:80")]
            ),
            Err(Error::InvalidState(_))
        );
        assert_matches!(
            catalog.update_policies(vec![allow("p", "default/a", &format!("default/{long}"))]),
            Err(Error::InvalidState(_))
        );
        assert_eq!(catalog.snapshot().generation, 0);

        // Without a trust domain only the label grammar applies.
        let unbound = MeshCatalog::new(DefaultPolicy::DenyAll);
        unbound.update_services(vec![svc("default", &long)]).unwrap();
        assert_matches!(
            unbound.update_services(vec![svc("default", "Book_Store")]),
            Err(Error::InvalidState(_))
        );

        catalog
            .update_services(vec![svc("default", "bookstore")])
            .unwrap();
        for s in catalog.snapshot().services() {
            assert!(s.namespaced_name().common_name("azure.mesh").is_ok());
        }
    }

    #[test]
    fn allowed_destinations_follow_default() {
        let services = vec![svc("default", "a"), svc("default", "b"), svc("default", "c")];
        let a = NamespacedService::new("default", "a");

        let deny = MeshCatalog::new(DefaultPolicy::DenyAll);
        deny.update_services(services.clone()).unwrap();
        assert!(deny.list_allowed_destinations(&a).is_empty());
        deny.update_policies(vec![allow("a-to-c", "default/a", "default/c")])
            .unwrap();
        let names: Vec<_> = deny
            .list_allowed_destinations(&a)
            .iter()
            .map(|s| s.namespaced_name().to_string())
            .collect();
        assert_eq!(names, vec!["default/c"]);

        let allow_all = MeshCatalog::new(DefaultPolicy::AllowAll);
        allow_all.update_services(services).unwrap();
        let names: Vec<_> = allow_all
            .list_allowed_destinations(&a)
            .iter()
            .map(|s| s.namespaced_name().to_string())
            .collect();
        assert_eq!(names, vec!["default/b", "default/c"]);
    }

    #[tokio::test]
    async fn subscribers_notified_per_update() {
        let catalog = MeshCatalog::new(DefaultPolicy::DenyAll);
        let mut sub = catalog.subscribe();
        assert_eq!(catalog.subscriber_count(), 1);

        let name = NamespacedService::new("default", "bookstore");
        catalog.update_services(vec![svc("default", "bookstore")]).unwrap();
        catalog.update_endpoints(&name, vec![]).unwrap();
        catalog.update_policies(vec![]).unwrap();
        // Failed updates are not announced.
        let _ = catalog.update_services(vec![svc("", "x")]);

        assert_eq!(
            sub.recv().await.unwrap(),
            CatalogChange {
                kind: ChangeKind::Services,
                generation: 1
            }
        );
        assert_eq!(
            sub.recv().await.unwrap(),
            CatalogChange {
                kind: ChangeKind::Endpoints(name),
                generation: 2
            }
        );
        assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Policies);
        assert!(sub.try_recv().is_none());

        drop(sub);
        assert_eq!(catalog.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn readers_observe_whole_updates() {
        let catalog = Arc::new(MeshCatalog::new(DefaultPolicy::DenyAll));
        let name = NamespacedService::new("default", "bookstore");
        catalog.update_services(vec![svc("default", "bookstore")]).unwrap();

        let writer = {
            let catalog = catalog.clone();
            let name = name.clone();
            tokio::task::spawn_blocking(move || {
                for i in 1..=200u16 {
                    let eps = (0..i % 10 + 1)
                        .map(|j| ep(&format!("10.0.{i}.{j}:80")))
                        .collect();
                    catalog.update_endpoints(&name, eps).unwrap();
                }
            })
        };
        let reader = {
            let catalog = catalog.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..500 {
                    let eps = catalog.list_endpoints_for_service(&name).unwrap();
                    // Every endpoint in one read comes from the same update.
                    let subnets: HashSet<_> = eps
                        .iter()
                        .map(|e| e.address.to_string().split('.').nth(2).map(str::to_string))
                        .collect();
                    assert!(subnets.len() <= 1, "observed a partial update: {eps:?}");
                }
            })
        };
        writer.await.unwrap();
        reader.await.unwrap();
    }
}
