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

use super::Proxy;
use super::types::Secret;
use crate::catalog::NamespacedService;
use crate::tls::IssuedCertificate;

pub const SERVICE_CERT_PURPOSE: &str = "service-cert";
pub const ROOT_CERT_PURPOSE: &str = "root-cert";

/// `<purpose>-<name>.<namespace>`.
pub fn secret_name(purpose: &str, service: &NamespacedService) -> String {
    format!("{purpose}-{}", service.resource_name())
}

/// The proxy's own certificate and key, and the root it validates peers against.
pub fn generate(proxy: &Proxy, cert: &IssuedCertificate) -> Vec<Secret> {
    // "root-cert-*" sorts before "service-cert-*".
    vec![
        Secret::with_validation_context(
            secret_name(ROOT_CERT_PURPOSE, &proxy.service),
            cert.root_certificate().clone(),
        ),
        Secret::with_tls_certificate(
            secret_name(SERVICE_CERT_PURPOSE, &proxy.service),
            cert.certificate_chain().clone(),
            cert.private_key().clone(),
        ),
    ]
}
