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
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::NamespacedService;
use crate::strng::Strng;

/// What happens to a source/destination pair no policy mentions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DefaultPolicy {
    #[default]
    DenyAll,
    AllowAll,
}

impl FromStr for DefaultPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deny" | "denyall" => Ok(DefaultPolicy::DenyAll),
            "allow" | "allowall" => Ok(DefaultPolicy::AllowAll),
            _ => Err(format!("unknown default policy {s:?}, expected allow or deny")),
        }
    }
}

impl fmt::Display for DefaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultPolicy::DenyAll => f.write_str("deny"),
            DefaultPolicy::AllowAll => f.write_str("allow"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyAction {
    Allow,
    Deny,
}

/// Directional rule between two services. Allow rules may narrow traffic to a
/// path prefix or port; Deny rules always cover the whole pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TrafficPolicy {
    pub name: Strng,
    pub source: NamespacedService,
    pub destination: NamespacedService,
    pub action: PolicyAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<Strng>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl TrafficPolicy {
    pub fn has_predicate(&self) -> bool {
        self.path_prefix.is_some() || self.port.is_some()
    }

    fn validate(&self, trust_domain: Option<&str>) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("policy name is empty".to_string());
        }
        self.source
            .validate_identity(trust_domain)
            .map_err(|e| format!("policy {}: {e}", self.name))?;
        self.destination
            .validate_identity(trust_domain)
            .map_err(|e| format!("policy {}: {e}", self.name))?;
        if let Some(prefix) = &self.path_prefix {
            if !prefix.starts_with('/') {
                return Err(format!(
                    "policy {}: path prefix {prefix:?} must start with '/'",
                    self.name
                ));
            }
        }
        if self.port == Some(0) {
            return Err(format!("policy {}: port 0", self.name));
        }
        if self.weight == Some(0) {
            return Err(format!("policy {}: weight 0", self.name));
        }
        if self.action == PolicyAction::Deny && (self.has_predicate() || self.weight.is_some()) {
            return Err(format!(
                "policy {}: deny policies cannot carry path, port or weight",
                self.name
            ));
        }
        Ok(())
    }
}

/// Validated set of traffic policies, indexed by name and by source.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PolicyStore {
    by_name: BTreeMap<Strng, Arc<TrafficPolicy>>,
    #[serde(skip)]
    by_source: BTreeMap<NamespacedService, Vec<Arc<TrafficPolicy>>>,
}

impl PolicyStore {
    /// Validates and indexes `policies`. With a trust domain, both ends of
    /// every policy must map to a valid certificate identity.
    pub fn from_policies(
        policies: Vec<TrafficPolicy>,
        trust_domain: Option<&str>,
    ) -> Result<PolicyStore, String> {
        let mut store = PolicyStore::default();
        for policy in policies {
            policy.validate(trust_domain)?;
            if store.by_name.contains_key(&policy.name) {
                return Err(format!("duplicate policy name {}", policy.name));
            }
            let policy = Arc::new(policy);
            store
                .by_source
                .entry(policy.source.clone())
                .or_default()
                .push(policy.clone());
            store.by_name.insert(policy.name.clone(), policy);
        }
        for rules in store.by_source.values_mut() {
            rules.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Ok(store)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TrafficPolicy>> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TrafficPolicy>> {
        self.by_name.values()
    }

    /// Policies from `source` to `destination`, ordered by name.
    pub fn between<'a>(
        &'a self,
        source: &NamespacedService,
        destination: &'a NamespacedService,
    ) -> impl Iterator<Item = &'a TrafficPolicy> + use<'a> {
        self.by_source
            .get(source)
            .into_iter()
            .flatten()
            .filter(move |p| &p.destination == destination)
            .map(|p| p.as_ref())
    }

    /// A Deny for the pair always wins; otherwise an Allow, or the default.
    pub fn allows(
        &self,
        default: DefaultPolicy,
        source: &NamespacedService,
        destination: &NamespacedService,
    ) -> bool {
        let mut allowed = default == DefaultPolicy::AllowAll;
        for policy in self.between(source, destination) {
            match policy.action {
                PolicyAction::Deny => return false,
                PolicyAction::Allow => allowed = true,
            }
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strng;

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

    fn deny(name: &str, src: &str, dst: &str) -> TrafficPolicy {
        TrafficPolicy {
            action: PolicyAction::Deny,
            ..allow(name, src, dst)
        }
    }

    #[test]
    fn deny_overrides_allow() {
        let store = PolicyStore::from_policies(vec![
            allow("a", "ns/client", "ns/server"),
            deny("b", "ns/client", "ns/server"),
        ], None)
        .unwrap();
        let (src, dst) = ("ns/client".parse().unwrap(), "ns/server".parse().unwrap());
        assert!(!store.allows(DefaultPolicy::DenyAll, &src, &dst));
        assert!(!store.allows(DefaultPolicy::AllowAll, &src, &dst));
    }

    #[test]
    fn defaults_apply_to_unmentioned_pairs() {
        let store =
            PolicyStore::from_policies(vec![allow("a", "ns/client", "ns/server")], None).unwrap();
        let src = "ns/client".parse().unwrap();
        let other = "ns/other".parse().unwrap();
        assert!(store.allows(DefaultPolicy::DenyAll, &src, &"ns/server".parse().unwrap()));
        assert!(!store.allows(DefaultPolicy::DenyAll, &src, &other));
        assert!(store.allows(DefaultPolicy::AllowAll, &src, &other));
        // Policies are directional.
        assert!(!store.allows(DefaultPolicy::DenyAll, &"ns/server".parse().unwrap(), &src));
    }

    #[test]
    fn rejects_invalid_policies() {
        let dup = vec![allow("a", "ns/x", "ns/y"), allow("a", "ns/x", "ns/z")];
        assert!(PolicyStore::from_policies(dup, None).is_err());

        let mut bad_deny = deny("d", "ns/x", "ns/y");
        bad_deny.port = Some(8080);
        assert!(PolicyStore::from_policies(vec![bad_deny], None).is_err());

        let mut bad_prefix = allow("p", "ns/x", "ns/y");
        bad_prefix.path_prefix = Some(strng::new("books"));
        assert!(PolicyStore::from_policies(vec![bad_prefix], None).is_err());
    }

    #[test]
    fn default_policy_from_str() {
        assert_eq!("allow".parse::<DefaultPolicy>().unwrap(), DefaultPolicy::AllowAll);
        assert_eq!("Deny".parse::<DefaultPolicy>().unwrap(), DefaultPolicy::DenyAll);
        assert!("maybe".parse::<DefaultPolicy>().is_err());
    }
}
