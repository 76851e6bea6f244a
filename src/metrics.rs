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

use std::fmt::Write;
use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::identity::CommonName;
use crate::{identity, version, xds};

/// Every metric the control plane exports, registered under `smc_`.
pub struct Metrics {
    pub identity: Arc<identity::metrics::Metrics>,
    pub xds: Arc<xds::metrics::Metrics>,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct BuildLabel {
    component: String,
    tag: String,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let build: Family<BuildLabel, Gauge> = Default::default();
        registry.register("build", "Control plane build info", build.clone());
        build
            .get_or_create(&BuildLabel {
                component: "smc".to_string(),
                tag: version::BuildInfo::new().version,
            })
            .set(1);

        Self {
            identity: Arc::new(identity::metrics::Metrics::new(registry)),
            xds: Arc::new(xds::metrics::Metrics::new(registry)),
        }
    }
}

impl From<&mut Registry> for Metrics {
    fn from(registry: &mut Registry) -> Self {
        Metrics::new(sub_registry(registry))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        Metrics::from(&mut registry)
    }
}

pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
    registry.sub_registry_with_prefix("smc")
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
    /// Record the given event by incrementing the counter by count
    fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
    R: Recorder<E, u64>,
{
    fn increment(&self, event: &E) {
        self.record(event, 1);
    }
}

impl EncodeLabelValue for CommonName {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(self.as_str())
    }
}
