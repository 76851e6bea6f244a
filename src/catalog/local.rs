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

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::{Endpoint, MeshCatalog, NamespacedService, Service, TrafficPolicy};
use crate::config::ConfigSource;

#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalEndpoints {
    pub service: NamespacedService,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Default, Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfig {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub endpoints: Vec<LocalEndpoints>,
    #[serde(default)]
    pub policies: Vec<TrafficPolicy>,
}

/// LocalClient feeds the catalog from a static YAML document, standing in for
/// a cluster watch. This is intended for local runs and testing.
pub struct LocalClient {
    pub cfg: ConfigSource,
    pub catalog: Arc<MeshCatalog>,
}

impl LocalClient {
    #[instrument(skip_all, name = "local_client")]
    pub async fn run(self) -> anyhow::Result<()> {
        let r: LocalConfig = serde_yaml::from_str(&self.cfg.read_to_string().await?)?;
        self.load_config(r)
    }

    fn load_config(&self, r: LocalConfig) -> anyhow::Result<()> {
        debug!(
            "load local config: {}",
            serde_yaml::to_string(&r).unwrap_or_default()
        );
        let services = r.services.len();
        let policies = r.policies.len();
        self.catalog.update_services(r.services)?;
        for eps in r.endpoints {
            self.catalog.update_endpoints(&eps.service, eps.endpoints)?;
        }
        self.catalog.update_policies(r.policies)?;
        info!(services, policies, "loaded local catalog");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DefaultPolicy;

    const CONFIG: &str = r#"
services:
- namespace: default
  name: bookstore
  port: 8080
- namespace: default
  name: bookbuyer
endpoints:
- service: default/bookstore
  endpoints:
  - address: 10.0.0.2
    port: 8080
    locality: zone-a
  - address: 10.0.0.1
    port: 8080
    weight: 50
policies:
- name: buyer-to-store
  source: default/bookbuyer
  destination: default/bookstore
  action: allow
  pathPrefix: /books
"#;

    #[tokio::test]
    async fn loads_static_catalog() {
        let catalog = Arc::new(MeshCatalog::new(DefaultPolicy::DenyAll));
        LocalClient {
            cfg: ConfigSource::Static(CONFIG.into()),
            catalog: catalog.clone(),
        }
        .run()
        .await
        .unwrap();

        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.services().count(), 2);
        let store = NamespacedService::new("default", "bookstore");
        let eps = snapshot.list_endpoints_for_service(&store).unwrap();
        assert_eq!(eps[0].socket_addr().to_string(), "10.0.0.1:8080");
        assert_eq!(eps[0].weight, Some(50));
        assert_eq!(eps[1].locality.as_deref(), Some("zone-a"));
        let buyer = NamespacedService::new("default", "bookbuyer");
        let allowed = snapshot.list_allowed_destinations(&buyer);
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].namespaced_name(), store);
    }

    #[tokio::test]
    async fn rejects_invalid_catalog() {
        let catalog = Arc::new(MeshCatalog::new(DefaultPolicy::DenyAll));
        let client = LocalClient {
            cfg: ConfigSource::Static("services:\n- namespace: default\n  name: a\n  port: 0\n".into()),
            catalog: catalog.clone(),
        };
        assert!(client.run().await.is_err());
        assert_eq!(catalog.snapshot().generation, 0);
    }
}
