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
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;

use crate::strng;
use crate::strng::Strng;
use crate::tls;
use crate::tls::IssuedCertificate;

mod ca;
pub use ca::*;

pub mod manager;
pub use manager::*;

pub mod metrics;

#[cfg(any(test, feature = "testing"))]
pub mod mock {
    pub use super::ca::mock::CountingAuthority;
    pub use super::manager::mock::{new_secret_manager, new_secret_manager_cfg};
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("failed to generate root certificate: {0}")]
    CaGeneration(String),
    #[error("certificate authority is not bootstrapped")]
    NotBootstrapped,
    #[error("invalid common name {0:?}: {1}")]
    InvalidCommonName(String, &'static str),
    #[error("failed to issue certificate for {0}: {1}")]
    Issuance(CommonName, String),
    #[error("certificate for {0} is no longer tracked")]
    Forgotten(CommonName),
    #[error("invalid certificate: {0}")]
    Certificate(Arc<tls::Error>),
    #[error("failed to write root certificate: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<tls::Error> for Error {
    fn from(value: tls::Error) -> Self {
        Error::Certificate(Arc::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

const MAX_COMMON_NAME_LEN: usize = 64;
const MAX_LABEL_LEN: usize = 63;

/// Checks a single DNS label: 1 to 63 bytes of `[a-z0-9-]`, not starting or
/// ending with '-'.
pub fn validate_dns_label(label: &str) -> Result<(), &'static str> {
    if label.is_empty() {
        return Err("empty label");
    }
    if label.len() > MAX_LABEL_LEN {
        return Err("labels may not be longer than 63 bytes");
    }
    if !label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err("labels may only contain [a-z0-9-]");
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err("labels may not start or end with '-'");
    }
    Ok(())
}

/// The identity a leaf certificate is issued for: lowercase DNS labels joined by dots,
/// at most 64 bytes. Services map to `<name>.<namespace>.<trust domain>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct CommonName(Strng);

impl CommonName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CommonName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Error::InvalidCommonName(s.to_string(), reason);
        if s.is_empty() {
            return Err(invalid("empty"));
        }
        if s.len() > MAX_COMMON_NAME_LEN {
            return Err(invalid("longer than 64 bytes"));
        }
        for label in s.split('.') {
            validate_dns_label(label).map_err(invalid)?;
        }
        Ok(CommonName(strng::new(s)))
    }
}

/// A signer of leaf certificates.
#[async_trait::async_trait]
pub trait CertificateProvider: Send + Sync + 'static {
    /// Issues a fresh certificate for `cn`. When `expires_after` is set the new
    /// certificate must expire strictly later than it.
    async fn issue(
        &self,
        cn: &CommonName,
        expires_after: Option<SystemTime>,
    ) -> Result<IssuedCertificate, Error>;

    /// PEM encoded root certificate that issued certificates chain to.
    fn root_certificate(&self) -> Result<Bytes, Error>;
}
