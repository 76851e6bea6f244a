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

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::{self, CommonName};
use crate::strng;
use crate::strng::Strng;

pub const DEFAULT_SERVICE_PORT: u16 = 80;

fn default_port() -> u16 {
    DEFAULT_SERVICE_PORT
}

/// Uniquely identifies a service in the mesh. Rendered (and serialized) as
/// `namespace/name`; discovery resources use `name.namespace` instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedService {
    pub namespace: Strng,
    pub name: Strng,
}

impl NamespacedService {
    pub fn new(namespace: impl AsRef<str>, name: impl AsRef<str>) -> NamespacedService {
        NamespacedService {
            namespace: strng::new(namespace),
            name: strng::new(name),
        }
    }

    /// The common name leaf certificates for this service are issued with.
    pub fn common_name(&self, trust_domain: &str) -> Result<CommonName, identity::Error> {
        format!("{}.{}.{}", self.name, self.namespace, trust_domain).parse()
    }

    /// The name of the cluster, route configuration and EDS assignment for
    /// this service. Both parts are DNS labels, so the first '.' splits it.
    pub fn resource_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }

    pub fn from_resource_name(s: &str) -> Result<NamespacedService, ParseServiceError> {
        let Some((name, namespace)) = s.split_once('.') else {
            return Err(ParseServiceError(s.to_string()));
        };
        let svc = NamespacedService::new(namespace, name);
        svc.validate().map_err(|_| ParseServiceError(s.to_string()))?;
        Ok(svc)
    }

    /// Namespace and name must each be a DNS label.
    pub(super) fn validate(&self) -> Result<(), String> {
        for (what, v) in [("namespace", &self.namespace), ("name", &self.name)] {
            identity::validate_dns_label(v)
                .map_err(|reason| format!("service {what} {v:?} is invalid: {reason}"))?;
        }
        Ok(())
    }

    /// Validates the service and checks that its certificate identity under
    /// `trust_domain` is a valid common name.
    pub(super) fn validate_identity(&self, trust_domain: Option<&str>) -> Result<(), String> {
        self.validate()?;
        if let Some(td) = trust_domain {
            self.common_name(td)
                .map_err(|e| format!("service {self} has no valid identity: {e}"))?;
        }
        Ok(())
    }
}

impl fmt::Display for NamespacedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Serialize for NamespacedService {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NamespacedService {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed service name {0:?}")]
pub struct ParseServiceError(String);

impl FromStr for NamespacedService {
    type Err = ParseServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((namespace, name)) = s.split_once('/') else {
            return Err(ParseServiceError(s.to_string()));
        };
        let svc = NamespacedService::new(namespace, name);
        svc.validate().map_err(|_| ParseServiceError(s.to_string()))?;
        Ok(svc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Service {
    pub namespace: Strng,
    pub name: Strng,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overrides the DNS name derived from the cluster domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<Strng>,
}

impl Service {
    pub fn new(namespace: impl AsRef<str>, name: impl AsRef<str>) -> Service {
        Service {
            namespace: strng::new(namespace),
            name: strng::new(name),
            port: DEFAULT_SERVICE_PORT,
            hostname: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Service {
        self.port = port;
        self
    }

    pub fn namespaced_name(&self) -> NamespacedService {
        NamespacedService {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn hostname(&self, cluster_domain: &str) -> Strng {
        match &self.hostname {
            Some(h) => h.clone(),
            None => strng::new(format!(
                "{}.{}.svc.{}",
                self.name, self.namespace, cluster_domain
            )),
        }
    }

    pub(super) fn validate(&self, trust_domain: Option<&str>) -> Result<(), String> {
        self.namespaced_name().validate_identity(trust_domain)?;
        if self.port == 0 {
            return Err(format!("service {} has port 0", self.namespaced_name()));
        }
        if self.hostname.as_ref().is_some_and(|h| h.is_empty()) {
            return Err(format!(
                "service {} has an empty hostname",
                self.namespaced_name()
            ));
        }
        Ok(())
    }
}

/// A network address backing a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
    /// The zone the endpoint runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<Strng>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Endpoint {
        Endpoint {
            address: addr.ip(),
            port: addr.port(),
            locality: None,
            weight: None,
        }
    }

    pub fn with_locality(mut self, zone: impl AsRef<str>) -> Endpoint {
        self.locality = Some(strng::new(zone));
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Endpoint {
        self.weight = Some(weight);
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub(super) fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err(format!("endpoint {} has port 0", self.address));
        }
        if self.weight == Some(0) {
            return Err(format!("endpoint {} has weight 0", self.socket_addr()));
        }
        Ok(())
    }
}
