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
use std::io::Cursor;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rustls_pemfile::Item;
use x509_parser::certificate::X509Certificate;

use crate::identity::CommonName;
use crate::tls::Error;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Expiration {
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl Expiration {
    pub fn valid_for(&self) -> Duration {
        self.not_after
            .duration_since(self.not_before)
            .unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.not_after
    }

    /// The instant at which `fraction` of the validity window has elapsed.
    pub fn refresh_at(&self, fraction: f64) -> SystemTime {
        self.not_before + self.valid_for().mul_f64(fraction.clamp(0.0, 1.0))
    }

    // If now() is already past the refresh point, we need to refresh ASAP, so return 0.
    pub fn duration_until_refresh(&self, fraction: f64) -> Duration {
        self.refresh_at(fraction)
            .duration_since(SystemTime::now())
            .unwrap_or_default()
    }
}

/// A leaf certificate with its key, as handed out to a proxy.
pub struct IssuedCertificate {
    common_name: CommonName,
    cert_chain: Bytes,
    private_key: Bytes,
    root_cert: Bytes,
    expiry: Expiration,
    serial: String,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("common_name", &self.common_name)
            .field("serial", &self.serial)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl IssuedCertificate {
    /// Builds an IssuedCertificate from PEM material. The leaf is the first
    /// certificate of `cert_chain`; its subject must carry `common_name`.
    pub fn new(
        common_name: CommonName,
        cert_chain: Bytes,
        private_key: Bytes,
        root_cert: Bytes,
    ) -> Result<IssuedCertificate, Error> {
        let chain = parse_cert_multi(&cert_chain)?;
        let (_, leaf) = x509_parser::parse_x509_certificate(&chain[0])?;
        let found = leaf_common_name(&leaf).unwrap_or_default();
        if found != common_name.as_str() {
            return Err(Error::CommonNameMismatch {
                expected: common_name.to_string(),
                found,
            });
        }
        let expiry = expiration(&leaf);
        let serial = leaf.raw_serial_as_string();
        parse_key(&private_key)?;
        parse_cert_multi(&root_cert).map_err(|e| Error::InvalidRootCert(e.to_string()))?;
        Ok(IssuedCertificate {
            common_name,
            cert_chain,
            private_key,
            root_cert,
            expiry,
            serial,
        })
    }

    pub fn common_name(&self) -> &CommonName {
        &self.common_name
    }

    /// PEM encoded leaf followed by any intermediates.
    pub fn certificate_chain(&self) -> &Bytes {
        &self.cert_chain
    }

    pub fn private_key(&self) -> &Bytes {
        &self.private_key
    }

    pub fn root_certificate(&self) -> &Bytes {
        &self.root_cert
    }

    pub fn expiration(&self) -> &Expiration {
        &self.expiry
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_expired(&self) -> bool {
        self.expiry.is_expired()
    }

    /// Checks that the chain is currently valid and terminates at `root_pem`.
    pub fn verify(&self, root_pem: &[u8]) -> Result<(), Error> {
        verify_chain(&self.cert_chain, root_pem)
    }
}

/// Verifies that `chain_pem` (leaf first) is signed, link by link, up to one of `roots_pem`.
pub fn verify_chain(chain_pem: &[u8], roots_pem: &[u8]) -> Result<(), Error> {
    let chain = parse_cert_multi(chain_pem)?;
    let roots =
        parse_cert_multi(roots_pem).map_err(|e| Error::InvalidRootCert(e.to_string()))?;
    let chain = chain
        .iter()
        .map(|der| x509_parser::parse_x509_certificate(der).map(|(_, c)| c))
        .collect::<Result<Vec<_>, _>>()?;
    let roots = roots
        .iter()
        .map(|der| x509_parser::parse_x509_certificate(der).map(|(_, c)| c))
        .collect::<Result<Vec<_>, _>>()?;

    for cert in chain.iter().chain(roots.iter()) {
        if !cert.validity().is_valid() {
            return Err(Error::UntrustedChain(format!(
                "{} is outside its validity period",
                cert.subject()
            )));
        }
    }
    for pair in chain.windows(2) {
        signed_by(&pair[0], &pair[1])?;
    }
    let last = &chain[chain.len() - 1];
    let mut last_err = None;
    for root in &roots {
        match signed_by(last, root) {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::UntrustedChain("no trusted roots".to_string())))
}

fn signed_by(child: &X509Certificate, issuer: &X509Certificate) -> Result<(), Error> {
    if child.issuer().as_raw() != issuer.subject().as_raw() {
        return Err(Error::UntrustedChain(format!(
            "{} was not issued by {}",
            child.subject(),
            issuer.subject()
        )));
    }
    let is_ca = issuer
        .basic_constraints()
        .ok()
        .flatten()
        .map(|bc| bc.value.ca)
        .unwrap_or(false);
    if !is_ca {
        return Err(Error::UntrustedChain(format!(
            "{} is not a certificate authority",
            issuer.subject()
        )));
    }
    child
        .verify_signature(Some(issuer.public_key()))
        .map_err(|e| Error::UntrustedChain(format!("bad signature on {}: {e}", child.subject())))
}

fn leaf_common_name(cert: &X509Certificate) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn expiration(cert: &X509Certificate) -> Expiration {
    Expiration {
        not_before: UNIX_EPOCH
            + Duration::from_secs(
                cert.validity
                    .not_before
                    .timestamp()
                    .try_into()
                    .unwrap_or_default(),
            ),
        not_after: UNIX_EPOCH
            + Duration::from_secs(
                cert.validity
                    .not_after
                    .timestamp()
                    .try_into()
                    .unwrap_or_default(),
            ),
    }
}

/// Parses every certificate in a PEM bundle into DER. An empty bundle is an error.
pub fn parse_cert_multi(mut cert: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(&mut cert));
    let parsed: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
    let certs = parsed
        .map_err(|e| Error::CertificateParseError(e.to_string()))?
        .into_iter()
        .map(|p| {
            let Item::X509Certificate(der) = p else {
                return Err(Error::CertificateParseError("no certificate".to_string()));
            };
            Ok(der.to_vec())
        })
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::CertificateParseError("no certificate".to_string()));
    }
    Ok(certs)
}

fn parse_key(mut key: &[u8]) -> Result<(), Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(&mut key));
    let parsed = rustls_pemfile::read_one(&mut reader)
        .map_err(|e| Error::CertificateParseError(e.to_string()))?
        .ok_or_else(|| Error::CertificateParseError("no key".to_string()))?;
    match parsed {
        Item::Pkcs8Key(_) | Item::Pkcs1Key(_) | Item::Sec1Key(_) => Ok(()),
        _ => Err(Error::CertificateParseError("no key".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    fn ca(name: &str) -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        (params.self_signed(&key).unwrap(), key)
    }

    fn leaf(cn: &str, issuer: &rcgen::Certificate, issuer_key: &KeyPair) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![cn.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        let cert = params.signed_by(&key, issuer, issuer_key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn refresh_at_fraction() {
        let not_before = UNIX_EPOCH + Duration::from_secs(1000);
        let exp = Expiration {
            not_before,
            not_after: not_before + Duration::from_secs(100),
        };
        assert_eq!(exp.valid_for(), Duration::from_secs(100));
        assert_eq!(exp.refresh_at(0.8), not_before + Duration::from_secs(80));
        assert_eq!(exp.refresh_at(2.0), exp.not_after);
        assert!(exp.is_expired());
        assert_eq!(exp.duration_until_refresh(0.8), Duration::ZERO);
        assert!(!exp.is_expired_at(not_before + Duration::from_secs(99)));
        assert!(exp.is_expired_at(not_before + Duration::from_secs(100)));
    }

    #[test]
    fn verify_against_issuing_root() {
        let (root, root_key) = ca("Root A");
        let (other, _) = ca("Root B");
        let cn: CommonName = "bookstore.default.azure.mesh".parse().unwrap();
        let (chain, key) = leaf(cn.as_str(), &root, &root_key);

        let issued = IssuedCertificate::new(
            cn.clone(),
            chain.clone().into(),
            key.into(),
            root.pem().into(),
        )
        .unwrap();
        assert_eq!(issued.common_name(), &cn);
        issued.verify(root.pem().as_bytes()).unwrap();

        assert_matches!(
            verify_chain(chain.as_bytes(), other.pem().as_bytes()),
            Err(Error::UntrustedChain(_))
        );
        let bundle = format!("{}{}", other.pem(), root.pem());
        verify_chain(chain.as_bytes(), bundle.as_bytes()).unwrap();
    }

    #[test]
    fn rejects_mismatched_common_name() {
        let (root, root_key) = ca("Root");
        let (chain, key) = leaf("a.default.azure.mesh", &root, &root_key);
        let res = IssuedCertificate::new(
            "b.default.azure.mesh".parse().unwrap(),
            chain.into(),
            key.into(),
            root.pem().into(),
        );
        assert_matches!(res, Err(Error::CommonNameMismatch { .. }));
    }

    #[test]
    fn rejects_garbage() {
        assert_matches!(
            parse_cert_multi(b"not a pem"),
            Err(Error::CertificateParseError(_))
        );
        assert_matches!(parse_cert_multi(b""), Err(Error::CertificateParseError(_)));
    }
}
