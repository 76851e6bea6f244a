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

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use super::TypeKind;
use crate::metrics::Recorder;

#[derive(Default)]
pub struct Metrics {
    pub pushes: Family<Push, Counter>,
    pub connection_terminations: Family<ConnectionTermination, Counter>,
    pub connected_proxies: Gauge,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct Push {
    pub kind: TypeKind,
    pub outcome: PushOutcome,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum PushOutcome {
    Sent,
    Timeout,
    Rejected,
    GenerationFailed,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionTermination {
    pub reason: ConnectionTerminationReason,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum ConnectionTerminationReason {
    Closed,
    InvalidRequest,
    PushFailures,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let m = Self::default();
        registry.register(
            "xds_pushes",
            "The total number of discovery responses attempted, by kind and outcome",
            m.pushes.clone(),
        );
        registry.register(
            "xds_connection_terminations",
            "The total number of proxy discovery sessions that ended",
            m.connection_terminations.clone(),
        );
        registry.register(
            "xds_connected_proxies",
            "The number of proxies with a live discovery session",
            m.connected_proxies.clone(),
        );
        m
    }
}

impl Recorder<Push, u64> for Metrics {
    fn record(&self, event: &Push, count: u64) {
        self.pushes.get_or_create(event).inc_by(count);
    }
}

impl Recorder<ConnectionTerminationReason, u64> for Metrics {
    fn record(&self, reason: &ConnectionTerminationReason, count: u64) {
        self.connection_terminations
            .get_or_create(&ConnectionTermination { reason: *reason })
            .inc_by(count);
    }
}
