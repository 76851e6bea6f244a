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
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelValue;
use prost::Name;
use prost_types::Any;

use crate::catalog::{self, NamespacedService, Snapshot};
use crate::identity::{self, CertificateAuthority, CertificateProvider, SecretManager};
use crate::strng::Strng;

pub mod cds;
pub mod eds;
pub mod metrics;
pub mod rds;
pub mod sds;
mod server;
mod session;
pub mod types;

pub use server::*;
pub use session::*;
use types::{Cluster, ClusterLoadAssignment, Node, RouteConfiguration, Secret};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to generate {0} resources: {1}")]
    Generation(TypeKind, String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("invalid discovery request: {0}")]
    InvalidRequest(String),
    #[error("identity: {0}")]
    Identity(#[from] identity::Error),
    #[error("catalog: {0}")]
    Catalog(#[from] catalog::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidRequest(_) => tonic::Status::invalid_argument(e.to_string()),
            Error::Transport(_) | Error::Io(_) => tonic::Status::unavailable(e.to_string()),
            Error::Generation(..) | Error::Identity(_) | Error::Catalog(_) => {
                tonic::Status::internal(e.to_string())
            }
        }
    }
}

/// The resource kinds served to proxies, in the order a full pass pushes them.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, EncodeLabelValue,
)]
pub enum TypeKind {
    Cluster,
    Endpoint,
    Route,
    Secret,
}

impl TypeKind {
    pub const ALL: [TypeKind; 4] = [
        TypeKind::Cluster,
        TypeKind::Endpoint,
        TypeKind::Route,
        TypeKind::Secret,
    ];

    pub fn type_url(&self) -> String {
        match self {
            TypeKind::Cluster => Cluster::type_url(),
            TypeKind::Endpoint => ClusterLoadAssignment::type_url(),
            TypeKind::Route => RouteConfiguration::type_url(),
            TypeKind::Secret => Secret::type_url(),
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<TypeKind> {
        TypeKind::ALL.into_iter().find(|k| k.type_url() == type_url)
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TypeKind::Cluster => "CDS",
            TypeKind::Endpoint => "EDS",
            TypeKind::Route => "RDS",
            TypeKind::Secret => "SDS",
        })
    }
}

/// A connected data-plane instance and the service it fronts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Proxy {
    pub id: Strng,
    pub service: NamespacedService,
}

impl Proxy {
    pub fn new(id: impl AsRef<str>, service: NamespacedService) -> Proxy {
        Proxy {
            id: crate::strng::new(id),
            service,
        }
    }

    /// Identifies a proxy from the node metadata of its first request.
    pub fn from_node(node: Option<&Node>) -> Result<Proxy, Error> {
        let node = node.ok_or_else(|| Error::InvalidRequest("missing node".to_string()))?;
        if node.id.is_empty() {
            return Err(Error::InvalidRequest("missing node id".to_string()));
        }
        let service = node
            .cluster
            .parse()
            .map_err(|e| Error::InvalidRequest(format!("node {}: {e}", node.id)))?;
        Ok(Proxy::new(&node.id, service))
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.service)
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct GeneratorConfig {
    pub trust_domain: Strng,
    pub cluster_domain: Strng,
    /// Port of the proxy's local admin listener, exposed as the observability cluster.
    pub proxy_admin_port: u16,
    pub connect_timeout: Duration,
}

/// Produces the resources of every kind for a proxy. Output depends only on
/// the catalog snapshot, the proxy and (for secrets) its current certificate.
pub struct Generators<T: CertificateProvider = CertificateAuthority> {
    certs: SecretManager<T>,
    cfg: GeneratorConfig,
}

impl<T: CertificateProvider> Generators<T> {
    pub fn new(certs: SecretManager<T>, cfg: GeneratorConfig) -> Generators<T> {
        Generators { certs, cfg }
    }

    pub fn certs(&self) -> &SecretManager<T> {
        &self.certs
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.cfg
    }

    /// Generates `kind` for `proxy`. `names` narrows the EDS cluster set; it is
    /// ignored for other kinds.
    pub async fn generate(
        &self,
        kind: TypeKind,
        proxy: &Proxy,
        snapshot: &Snapshot,
        names: &[Strng],
    ) -> Result<Vec<Any>, Error> {
        match kind {
            TypeKind::Cluster => encode(kind, cds::generate(snapshot, proxy, &self.cfg)?),
            TypeKind::Endpoint => encode(kind, eds::generate(snapshot, proxy, names)?),
            TypeKind::Route => encode(kind, rds::generate(snapshot, proxy, &self.cfg)),
            TypeKind::Secret => {
                let cn = proxy.service.common_name(&self.cfg.trust_domain)?;
                let cert = self.certs.issue_certificate(&cn).await?;
                encode(kind, sds::generate(proxy, &cert))
            }
        }
    }
}

fn encode<M: prost::Message + Name>(
    kind: TypeKind,
    resources: Vec<M>,
) -> Result<Vec<Any>, Error> {
    resources
        .iter()
        .map(|r| Any::from_msg(r).map_err(|e| Error::Generation(kind, e.to_string())))
        .collect()
}
