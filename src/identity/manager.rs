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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use super::metrics::{Issuance, IssuanceOutcome, IssuanceReason, Metrics};
use super::{CertificateAuthority, CertificateProvider, CommonName, Error, RootBundle};
use crate::metrics::IncrementRecorder;
use crate::tls::{Expiration, IssuedCertificate};

pub const DEFAULT_ROTATION_FRACTION: f64 = 0.8;
pub const CERT_REFRESH_FAILURE_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct SecretManagerConfig {
    /// Fraction of the validity window after which a certificate is rotated.
    pub rotation_fraction: f64,
    pub refresh_retry_delay: Duration,
}

impl Default for SecretManagerConfig {
    fn default() -> Self {
        SecretManagerConfig {
            rotation_fraction: DEFAULT_ROTATION_FRACTION,
            refresh_retry_delay: CERT_REFRESH_FAILURE_RETRY_DELAY,
        }
    }
}

type CertState = Option<Arc<IssuedCertificate>>;

struct CertSlot {
    tx: watch::Sender<CertState>,
    // Held for the duration of an issuance so concurrent requests coalesce.
    issuing: tokio::sync::Mutex<()>,
    refresh: Mutex<Option<AbortHandle>>,
    forgotten: AtomicBool,
    // Mutated only while holding the cache lock.
    watchers: AtomicUsize,
}

impl CertSlot {
    fn new() -> CertSlot {
        CertSlot {
            tx: watch::channel(None).0,
            issuing: Default::default(),
            refresh: Default::default(),
            forgotten: Default::default(),
            watchers: Default::default(),
        }
    }

    /// The cached certificate, if it has not expired.
    fn current(&self) -> Option<Arc<IssuedCertificate>> {
        self.tx
            .borrow()
            .as_ref()
            .filter(|c| !c.is_expired())
            .cloned()
    }

    fn forget(&self) {
        self.forgotten.store(true, Ordering::SeqCst);
        if let Some(handle) = self.refresh.lock().unwrap().take() {
            handle.abort();
        }
    }
}

type Cache = Arc<Mutex<HashMap<CommonName, Arc<CertSlot>>>>;

fn forget_locked(
    cache: &mut HashMap<CommonName, Arc<CertSlot>>,
    cn: &CommonName,
    slot: &Arc<CertSlot>,
) {
    if cache.get(cn).is_some_and(|s| Arc::ptr_eq(s, slot)) {
        cache.remove(cn);
    }
    slot.forget();
}

/// Caches leaf certificates per common name, issues each one at most once at
/// a time, and rotates them in the background once `rotation_fraction` of
/// their validity has elapsed.
pub struct SecretManager<T: CertificateProvider = CertificateAuthority> {
    client: Arc<T>,
    cfg: SecretManagerConfig,
    cache: Cache,
    metrics: Arc<Metrics>,
}

impl<T: CertificateProvider> Clone for SecretManager<T> {
    fn clone(&self) -> Self {
        SecretManager {
            client: self.client.clone(),
            cfg: self.cfg.clone(),
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl SecretManager<CertificateAuthority> {
    /// Bootstraps the root certificate authority backing this manager.
    pub fn bootstrap(&self, organization: &str, validity: Duration) -> Result<RootBundle, Error> {
        self.client.bootstrap(organization, validity)
    }
}

impl<T: CertificateProvider> SecretManager<T> {
    pub fn new(client: T, cfg: SecretManagerConfig, metrics: Arc<Metrics>) -> SecretManager<T> {
        SecretManager {
            client: Arc::new(client),
            cfg,
            cache: Default::default(),
            metrics,
        }
    }

    pub fn client(&self) -> &T {
        &self.client
    }

    pub fn root_certificate(&self) -> Result<bytes::Bytes, Error> {
        self.client.root_certificate()
    }

    fn slot(&self, cn: &CommonName) -> Arc<CertSlot> {
        self.cache
            .lock()
            .unwrap()
            .entry(cn.clone())
            .or_insert_with(|| Arc::new(CertSlot::new()))
            .clone()
    }

    /// Returns the cached certificate for `cn`, issuing one if none is cached or
    /// the cached one has expired. Concurrent callers for the same name share a
    /// single issuance.
    #[instrument(skip_all, fields(%cn))]
    pub async fn issue_certificate(&self, cn: &CommonName) -> Result<Arc<IssuedCertificate>, Error> {
        let slot = self.slot(cn);
        if let Some(cert) = slot.current() {
            return Ok(cert);
        }
        let _issuing = slot.issuing.lock().await;
        if let Some(cert) = slot.current() {
            debug!("certificate issued by concurrent request");
            return Ok(cert);
        }
        self.issue_locked(cn, &slot, IssuanceReason::Initial).await
    }

    /// Replaces the certificate for `cn` with a fresh one that expires strictly
    /// later than the one it replaces.
    #[instrument(skip_all, fields(%cn))]
    pub async fn rotate_certificate(&self, cn: &CommonName) -> Result<Arc<IssuedCertificate>, Error> {
        let slot = self.slot(cn);
        self.rotate_slot(cn, &slot).await
    }

    async fn rotate_slot(
        &self,
        cn: &CommonName,
        slot: &Arc<CertSlot>,
    ) -> Result<Arc<IssuedCertificate>, Error> {
        let _issuing = slot.issuing.lock().await;
        self.issue_locked(cn, slot, IssuanceReason::Rotation).await
    }

    // Callers must hold slot.issuing.
    async fn issue_locked(
        &self,
        cn: &CommonName,
        slot: &Arc<CertSlot>,
        reason: IssuanceReason,
    ) -> Result<Arc<IssuedCertificate>, Error> {
        let floor = match reason {
            IssuanceReason::Rotation => slot.tx.borrow().as_ref().map(|c| c.expiration().not_after),
            IssuanceReason::Initial => None,
        };
        match self.client.issue(cn, floor).await {
            Ok(cert) => {
                let cert = Arc::new(cert);
                self.metrics.increment(&Issuance {
                    reason,
                    outcome: IssuanceOutcome::Success,
                });
                self.metrics.set_expiration(cn, cert.expiration());
                info!(
                    serial = cert.serial(),
                    ?reason,
                    "issued certificate valid for {:?}",
                    cert.expiration().valid_for()
                );
                slot.tx.send_replace(Some(cert.clone()));
                self.ensure_refresh(cn, slot);
                Ok(cert)
            }
            Err(e) => {
                self.metrics.increment(&Issuance {
                    reason,
                    outcome: IssuanceOutcome::Failure,
                });
                let mut cache = self.cache.lock().unwrap();
                if slot.watchers.load(Ordering::SeqCst) == 0 && slot.tx.borrow().is_none() {
                    forget_locked(&mut cache, cn, slot);
                }
                Err(e)
            }
        }
    }

    fn ensure_refresh(&self, cn: &CommonName, slot: &Arc<CertSlot>) {
        let mut refresh = slot.refresh.lock().unwrap();
        if slot.forgotten.load(Ordering::SeqCst) {
            return;
        }
        if refresh.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let task = tokio::spawn(self.clone().refresh_handler(cn.clone(), slot.clone()));
        *refresh = Some(task.abort_handle());
    }

    #[instrument(skip_all, fields(%cn))]
    async fn refresh_handler(self, cn: CommonName, slot: Arc<CertSlot>) {
        let mut rx = slot.tx.subscribe();
        loop {
            let Some(cert) = rx.borrow_and_update().clone() else {
                // Evicted; wait for the next issuance.
                if rx.changed().await.is_err() {
                    return;
                }
                continue;
            };
            let wait = cert
                .expiration()
                .duration_until_refresh(self.cfg.rotation_fraction);
            debug!("rotating certificate in {wait:?}");
            tokio::select! {
                _ = sleep(wait) => {},
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
            loop {
                match self.rotate_slot(&cn, &slot).await {
                    Ok(_) => break,
                    Err(e) => {
                        warn!("failed to rotate certificate: {e}");
                        let evicted = slot.tx.send_if_modified(|c| {
                            if c.as_ref().is_some_and(|c| c.is_expired()) {
                                *c = None;
                                true
                            } else {
                                false
                            }
                        });
                        if evicted {
                            info!("evicted expired certificate");
                            self.metrics.clear_expiration(&cn);
                        }
                    }
                }
                tokio::select! {
                    _ = sleep(self.cfg.refresh_retry_delay) => {},
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Subscribes to certificate changes for `cn`. The name stays tracked (and
    /// rotated) until the last watch for it is dropped.
    pub fn watch(&self, cn: &CommonName) -> CertWatch {
        let mut cache = self.cache.lock().unwrap();
        let slot = cache
            .entry(cn.clone())
            .or_insert_with(|| Arc::new(CertSlot::new()))
            .clone();
        slot.watchers.fetch_add(1, Ordering::SeqCst);
        CertWatch {
            cn: cn.clone(),
            rx: slot.tx.subscribe(),
            slot,
            cache: self.cache.clone(),
        }
    }

    /// Stops tracking `cn`: the rotation task is cancelled and the cached
    /// certificate dropped.
    pub fn forget_certificate(&self, cn: &CommonName) {
        let removed = self.cache.lock().unwrap().remove(cn);
        if let Some(slot) = removed {
            slot.forget();
            slot.tx.send_replace(None);
            self.metrics.clear_expiration(cn);
            info!(%cn, "forgot certificate");
        }
    }

    pub fn tracked(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn dump(&self) -> Vec<CertDump> {
        let cache = self.cache.lock().unwrap();
        let mut dump: Vec<CertDump> = cache
            .iter()
            .map(|(cn, slot)| {
                let cert = slot.tx.borrow().clone();
                CertDump {
                    common_name: cn.clone(),
                    state: match &cert {
                        Some(c) if c.is_expired() => CertStatus::Expired,
                        Some(_) => CertStatus::Available,
                        None => CertStatus::Pending,
                    },
                    serial: cert.as_ref().map(|c| c.serial().to_string()),
                    expiration: cert.as_ref().map(|c| c.expiration().clone()),
                    watchers: slot.watchers.load(Ordering::SeqCst),
                }
            })
            .collect();
        dump.sort_by(|a, b| a.common_name.cmp(&b.common_name));
        dump
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum CertStatus {
    Pending,
    Available,
    Expired,
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertDump {
    pub common_name: CommonName,
    pub state: CertStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<Expiration>,
    pub watchers: usize,
}

/// A subscription to the certificate of one common name.
pub struct CertWatch {
    cn: CommonName,
    rx: watch::Receiver<Option<Arc<IssuedCertificate>>>,
    slot: Arc<CertSlot>,
    cache: Cache,
}

impl CertWatch {
    pub fn common_name(&self) -> &CommonName {
        &self.cn
    }

    pub fn current(&self) -> Option<Arc<IssuedCertificate>> {
        self.rx.borrow().clone()
    }

    /// Waits for the certificate to be issued, rotated or evicted.
    pub async fn changed(&mut self) -> Result<Option<Arc<IssuedCertificate>>, Error> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::Forgotten(self.cn.clone()))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

impl Drop for CertWatch {
    fn drop(&mut self) {
        let mut cache = self.cache.lock().unwrap();
        if self.slot.watchers.fetch_sub(1, Ordering::SeqCst) == 1 {
            forget_locked(&mut cache, &self.cn, &self.slot);
            debug!(cn = %self.cn, "last watcher dropped, forgetting certificate");
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod mock {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{SecretManager, SecretManagerConfig};
    use crate::identity::mock::CountingAuthority;
    use crate::identity::metrics::Metrics;

    pub fn new_secret_manager(leaf_validity: Duration) -> SecretManager<CountingAuthority> {
        new_secret_manager_cfg(SecretManagerConfig::default(), leaf_validity, Duration::ZERO)
    }

    pub fn new_secret_manager_cfg(
        cfg: SecretManagerConfig,
        leaf_validity: Duration,
        delay: Duration,
    ) -> SecretManager<CountingAuthority> {
        SecretManager::new(
            CountingAuthority::new(leaf_validity, delay),
            cfg,
            Arc::new(Metrics::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use matches::assert_matches;

    fn cn(s: &str) -> CommonName {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn concurrent_issuance_is_coalesced() {
        let sm = new_secret_manager_cfg(
            SecretManagerConfig::default(),
            Duration::from_secs(20 * 60),
            Duration::from_millis(50),
        );
        let name = cn("bookstore.default.azure.mesh");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sm = sm.clone();
                let name = name.clone();
                tokio::spawn(async move { sm.issue_certificate(&name).await })
            })
            .collect();
        let mut certs = Vec::new();
        for t in tasks {
            certs.push(t.await.unwrap().unwrap());
        }
        assert_eq!(sm.client().issued(), 1);
        for c in &certs {
            assert_eq!(c.expiration(), certs[0].expiration());
            assert_eq!(c.serial(), certs[0].serial());
        }
    }

    #[tokio::test]
    async fn distinct_names_issue_independently() {
        let sm = new_secret_manager(Duration::from_secs(60));
        let a = sm.issue_certificate(&cn("a.default.azure.mesh")).await.unwrap();
        let b = sm.issue_certificate(&cn("b.default.azure.mesh")).await.unwrap();
        assert_ne!(a.serial(), b.serial());
        assert_eq!(sm.client().issued(), 2);
        // A second request is served from the cache.
        sm.issue_certificate(&cn("a.default.azure.mesh")).await.unwrap();
        assert_eq!(sm.client().issued(), 2);
    }

    #[tokio::test]
    async fn rotation_extends_expiry() {
        let sm = new_secret_manager(Duration::from_secs(60));
        let name = cn("bookstore.default.azure.mesh");
        let first = sm.issue_certificate(&name).await.unwrap();
        let second = sm.rotate_certificate(&name).await.unwrap();
        assert!(second.expiration().not_after > first.expiration().not_after);
        let third = sm.rotate_certificate(&name).await.unwrap();
        assert!(third.expiration().not_after > second.expiration().not_after);
        third.verify(&sm.root_certificate().unwrap()).unwrap();
        // Rotation replaces the cached certificate.
        let cached = sm.issue_certificate(&name).await.unwrap();
        assert_eq!(cached.serial(), third.serial());
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_in_background() {
        let sm = new_secret_manager(Duration::from_secs(10));
        let name = cn("bookstore.default.azure.mesh");
        let mut w = sm.watch(&name);
        let first = sm.issue_certificate(&name).await.unwrap();
        // The initial issuance is observed first.
        let seen = w.changed().await.unwrap().unwrap();
        assert_eq!(seen.serial(), first.serial());
        let rotated = w.changed().await.unwrap().unwrap();
        assert_ne!(rotated.serial(), first.serial());
        assert!(rotated.expiration().not_after > first.expiration().not_after);
        assert_eq!(sm.client().issued(), 2);
    }

    #[tokio::test]
    async fn last_watch_forgets() {
        let sm = new_secret_manager(Duration::from_secs(60));
        let name = cn("bookstore.default.azure.mesh");
        let w1 = sm.watch(&name);
        let w2 = sm.watch(&name);
        sm.issue_certificate(&name).await.unwrap();
        assert_eq!(sm.tracked(), 1);
        assert_eq!(sm.dump()[0].watchers, 2);
        drop(w1);
        assert_eq!(sm.tracked(), 1);
        drop(w2);
        assert_eq!(sm.tracked(), 0);
    }

    #[tokio::test]
    async fn forget_clears_watchers() {
        let sm = new_secret_manager(Duration::from_secs(60));
        let name = cn("bookstore.default.azure.mesh");
        let mut w = sm.watch(&name);
        sm.issue_certificate(&name).await.unwrap();
        assert!(w.changed().await.unwrap().is_some());
        sm.forget_certificate(&name);
        assert!(w.changed().await.unwrap().is_none());
        assert_eq!(sm.tracked(), 0);
    }

    #[tokio::test]
    async fn failed_issuance_is_not_cached() {
        let sm = new_secret_manager(Duration::from_secs(60));
        sm.client().set_failing(true);
        let name = cn("bookstore.default.azure.mesh");
        assert_matches!(sm.issue_certificate(&name).await, Err(Error::Issuance(..)));
        assert_eq!(sm.tracked(), 0);
        sm.client().set_failing(false);
        sm.issue_certificate(&name).await.unwrap();
        assert_eq!(sm.client().issued(), 1);
    }

    #[tokio::test]
    async fn bootstrap_then_issue() {
        let sm = SecretManager::new(
            CertificateAuthority::new(Duration::from_secs(20 * 60)),
            SecretManagerConfig::default(),
            Arc::new(Metrics::default()),
        );
        let name = cn("bookstore.default.azure.mesh");
        assert_matches!(sm.issue_certificate(&name).await, Err(Error::NotBootstrapped));
        let root = sm
            .bootstrap("Azure Mesh", Duration::from_secs(60 * 60))
            .unwrap();
        let cert = sm.issue_certificate(&name).await.unwrap();
        assert_eq!(cert.root_certificate(), &root.cert_pem);
        crate::tls::verify_chain(cert.certificate_chain(), &root.cert_pem).unwrap();
    }
}
