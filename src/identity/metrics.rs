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

use std::time::UNIX_EPOCH;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};

use crate::identity::CommonName;
use crate::metrics::Recorder;
use crate::tls::Expiration;

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct CertExpirationLabels {
    pub common_name: CommonName,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct Issuance {
    pub reason: IssuanceReason,
    pub outcome: IssuanceOutcome,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum IssuanceReason {
    Initial,
    Rotation,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum IssuanceOutcome {
    Success,
    Failure,
}

#[derive(Default)]
pub struct Metrics {
    pub issuances: Family<Issuance, Counter>,
    pub cert_expiration_timestamp: Family<CertExpirationLabels, Gauge>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let m = Self::default();
        registry.register(
            "certificate_issuances",
            "The total number of leaf certificate issuance attempts",
            m.issuances.clone(),
        );
        registry.register_with_unit(
            "cert_expiration_timestamp",
            "Unix time at which the current leaf certificate for a common name expires",
            Unit::Seconds,
            m.cert_expiration_timestamp.clone(),
        );
        m
    }

    pub fn set_expiration(&self, cn: &CommonName, expiry: &Expiration) {
        let ts = expiry
            .not_after
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        self.cert_expiration_timestamp
            .get_or_create(&CertExpirationLabels {
                common_name: cn.clone(),
            })
            .set(ts);
    }

    pub fn clear_expiration(&self, cn: &CommonName) {
        self.cert_expiration_timestamp
            .remove(&CertExpirationLabels {
                common_name: cn.clone(),
            });
    }
}

impl Recorder<Issuance, u64> for Metrics {
    fn record(&self, event: &Issuance, count: u64) {
        self.issuances.get_or_create(event).inc_by(count);
    }
}
