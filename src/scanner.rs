use crate::mqtt::CONNACK_ACCEPTED;
use crate::probe::{self, insecure_tls_connector};
use crate::types::{
    default_credentials, Credential, ProbeOutcome, ScanResult, ScanResults, Target,
};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_native_tls::TlsConnector;
use tracing::{debug, info, warn};

/// Per-run settings shared by every probe unit.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Budget for each individual network call (probe or handshake).
    pub timeout: Duration,
    /// Wrap handshakes in TLS.
    pub tls: bool,
    /// Prefix for generated MQTT client identifiers.
    pub client_id: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            tls: false,
            client_id: "mqtt-scan".to_string(),
        }
    }
}

/// Drives targets through probe, anonymous login and the credential walk.
#[derive(Clone)]
pub struct Checker {
    config: ScanConfig,
    credentials: Arc<[Credential]>,
    tls: Option<TlsConnector>,
}

impl Checker {
    pub fn new(config: ScanConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        let tls = if config.tls {
            Some(insecure_tls_connector().context("failed to initialise TLS connector")?)
        } else {
            None
        };
        Ok(Self {
            config,
            credentials: default_credentials().into(),
            tls,
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Reachability check for `target`.
    pub async fn probe(&self, target: &Target) -> bool {
        probe::is_reachable(&target.host, target.port, self.config.timeout).await
    }

    /// One session attempt. Returns the CONNACK code if one arrived.
    pub async fn try_login(
        &self,
        target: &Target,
        credential: Option<&Credential>,
    ) -> Option<u8> {
        let client_id = probe::next_client_id(&self.config.client_id);
        probe::try_login(
            target,
            self.config.timeout,
            &client_id,
            credential,
            self.tls.as_ref(),
        )
        .await
    }

    /// Walk one target to its terminal outcome.
    ///
    /// Strictly sequential: probe, anonymous session, then each default
    /// credential in declared order, stopping at the first accepted one.
    pub async fn classify(&self, target: &Target) -> ProbeOutcome {
        debug!(target = %target, "testing");
        if !self.probe(target).await {
            debug!(target = %target, "not an MQTT broker or unreachable");
            return ProbeOutcome::Unreachable;
        }

        if self.try_login(target, None).await == Some(CONNACK_ACCEPTED) {
            info!(target = %target, "unauthenticated access allowed");
            return ProbeOutcome::OpenAccess;
        }

        for cred in self.credentials.iter() {
            if self.try_login(target, Some(cred)).await == Some(CONNACK_ACCEPTED) {
                info!(target = %target, credential = %cred, "login successful");
                return ProbeOutcome::Authenticated(cred.clone());
            }
        }

        debug!(target = %target, "no default credentials worked");
        ProbeOutcome::AccessDenied
    }
}

/// Counters and the result map, shareable with a status endpoint while a scan runs.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub scanned_done: Arc<AtomicU64>,
    pub entries: Arc<Mutex<BTreeMap<String, ScanResult>>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            scanned_done: Arc::new(AtomicU64::new(0)),
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Vulnerable entries recorded so far. Counts keys, so a target listed
    /// twice is counted once.
    pub async fn vulnerable_count(&self) -> u64 {
        count_vulnerable(&*self.entries.lock().await)
    }
}

fn count_vulnerable(entries: &BTreeMap<String, ScanResult>) -> u64 {
    entries.values().filter(|r| r.outcome.is_vulnerable()).count() as u64
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify every target concurrently, one task per target with no cap.
///
/// - Each task records exactly one result; duplicate keys are last-write-wins.
/// - The result lock is held only for the insert, never across network I/O.
/// - Per-target failures are absorbed into the outcome; the scan itself never fails.
pub async fn scan_targets(targets: &[Target], checker: &Checker) -> ScanResults {
    scan_targets_with_shared(targets, checker, SharedProgress::new()).await
}

pub async fn scan_targets_with_shared(
    targets: &[Target],
    checker: &Checker,
    shared: SharedProgress,
) -> ScanResults {
    let mut set = JoinSet::new();

    for target in targets.iter().cloned() {
        let checker = checker.clone();
        let shared = shared.clone();

        set.spawn(async move {
            let outcome = checker.classify(&target).await;
            let key = target.key();
            let result = ScanResult { target, outcome };
            {
                let mut guard = shared.entries.lock().await;
                guard.insert(key, result);
            }
            shared.scanned_done.fetch_add(1, Ordering::Relaxed);
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "probe task did not complete");
        }
    }

    let entries = shared.entries.lock().await.clone();
    ScanResults {
        scanned_total: targets.len() as u64,
        scanned_done: shared.scanned_done.load(Ordering::Relaxed),
        vulnerable_count: count_vulnerable(&entries),
        entries,
    }
}
