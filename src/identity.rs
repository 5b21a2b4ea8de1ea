use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::storage::IdentityStore;

// Versioned so a new derivation scheme never reads an old value.
pub const DEFAULT_STORAGE_KEY: &str = "fingerprint_v2_machine";

pub const DEFAULT_MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationStrategy {
    Primary,
    FallbackHash,
    FallbackRandom,
}

impl DerivationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationStrategy::Primary => "primary",
            DerivationStrategy::FallbackHash => "fallback_hash",
            DerivationStrategy::FallbackRandom => "fallback_random",
        }
    }

    pub fn from_stored(value: &str) -> Self {
        match value {
            "primary" => DerivationStrategy::Primary,
            "fallback_hash" => DerivationStrategy::FallbackHash,
            _ => DerivationStrategy::FallbackRandom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRecord {
    pub identifier: String,
    pub strategy: DerivationStrategy,
    pub created_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn new(identifier: impl Into<String>, strategy: DerivationStrategy) -> Self {
        Self {
            identifier: identifier.into(),
            strategy,
            created_at: Utc::now(),
        }
    }
}

pub trait FingerprintStrategy: Send + Sync {
    fn kind(&self) -> DerivationStrategy;
    fn derive(&self) -> Result<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub user_agent: String,
    pub language: String,
    pub timezone: String,
    pub screen: String,
}

impl Signals {
    pub fn collect(user_agent: &str) -> Self {
        let language = ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .filter_map(|key| env::var(key).ok())
            .find(|value| !value.trim().is_empty())
            .unwrap_or_default();
        let timezone = env::var("TZ")
            .ok()
            .filter(|tz| !tz.trim().is_empty())
            .unwrap_or_else(|| chrono::Local::now().offset().to_string());
        let screen = match (env::var("COLUMNS"), env::var("LINES")) {
            (Ok(cols), Ok(lines)) => format!("{cols}x{lines}"),
            _ => String::new(),
        };
        Self {
            user_agent: user_agent.to_string(),
            language,
            timezone,
            screen,
        }
    }

    fn joined(&self) -> String {
        [
            self.user_agent.as_str(),
            self.language.as_str(),
            self.timezone.as_str(),
            self.screen.as_str(),
        ]
        .join("|")
    }
}

pub struct MachineFingerprint {
    paths: Vec<PathBuf>,
    user: String,
}

impl MachineFingerprint {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        let user = env::var("USER")
            .or_else(|_| env::var("USERNAME"))
            .unwrap_or_default();
        Self { paths, user }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    fn machine_id(&self) -> Option<String> {
        self.paths.iter().find_map(|path| {
            fs::read_to_string(path)
                .ok()
                .map(|raw| raw.trim().to_string())
                .filter(|id| !id.is_empty())
        })
    }
}

impl Default for MachineFingerprint {
    fn default() -> Self {
        Self::new(DEFAULT_MACHINE_ID_PATHS.iter().map(PathBuf::from).collect())
    }
}

impl FingerprintStrategy for MachineFingerprint {
    fn kind(&self) -> DerivationStrategy {
        DerivationStrategy::Primary
    }

    fn derive(&self) -> Result<String> {
        let Some(machine_id) = self.machine_id() else {
            bail!("identity: no readable machine id source");
        };
        let digest = sha256_hex(&format!("{}|{}", machine_id, self.user));
        Ok(digest[..32].to_string())
    }
}

pub struct HashFingerprint {
    signals: Signals,
}

impl HashFingerprint {
    pub fn new(signals: Signals) -> Self {
        Self { signals }
    }
}

impl FingerprintStrategy for HashFingerprint {
    fn kind(&self) -> DerivationStrategy {
        DerivationStrategy::FallbackHash
    }

    fn derive(&self) -> Result<String> {
        let mut rng = rand::thread_rng();
        let salt = (0..4)
            .map(|_| rng.gen::<u32>().to_string())
            .collect::<Vec<_>>()
            .join("-");
        Ok(sha256_hex(&format!("{}|{}", self.signals.joined(), salt)))
    }
}

pub struct Provider {
    store: Option<Arc<dyn IdentityStore>>,
    key: String,
    strategies: Vec<Box<dyn FingerprintStrategy>>,
    resolved: OnceCell<IdentityRecord>,
}

impl Provider {
    pub fn new(store: Option<Arc<dyn IdentityStore>>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            strategies: Vec::new(),
            resolved: OnceCell::new(),
        }
    }

    pub fn standard(
        store: Option<Arc<dyn IdentityStore>>,
        key: impl Into<String>,
        machine_id_paths: Vec<PathBuf>,
        user_agent: &str,
    ) -> Self {
        Self::new(store, key)
            .with_strategy(MachineFingerprint::new(machine_id_paths))
            .with_strategy(HashFingerprint::new(Signals::collect(user_agent)))
    }

    pub fn with_strategy(mut self, strategy: impl FingerprintStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn identifier(&self) -> String {
        self.record().identifier
    }

    pub fn record(&self) -> IdentityRecord {
        self.resolved.get_or_init(|| self.resolve()).clone()
    }

    pub fn forget(&self) -> Result<bool> {
        match self.store.as_ref() {
            Some(store) => store.remove(&self.key),
            None => Ok(false),
        }
    }

    fn resolve(&self) -> IdentityRecord {
        let Some(store) = self.store.as_deref() else {
            warn!("identity: no persistent storage, identifier will not survive restart");
            return self.random(None);
        };

        match store.load(&self.key) {
            Ok(Some(record)) if !record.identifier.trim().is_empty() => {
                debug!(key = %self.key, strategy = record.strategy.as_str(), "identity: loaded stored identifier");
                return record;
            }
            Ok(Some(_)) => {
                warn!(key = %self.key, "identity: discarding blank stored identifier");
                if let Err(err) = store.remove(&self.key) {
                    debug!(error = %err, "identity: blank identifier not removed");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "identity: storage read failed");
                return self.random(Some(store));
            }
        }

        for strategy in &self.strategies {
            let kind = strategy.kind();
            match strategy.derive() {
                Ok(identifier) if !identifier.trim().is_empty() => {
                    let record = IdentityRecord::new(identifier, kind);
                    return match store.insert_if_absent(&self.key, &record) {
                        Ok(winner) if !winner.identifier.trim().is_empty() => {
                            info!(strategy = winner.strategy.as_str(), "identity: derived identifier");
                            winner
                        }
                        Ok(_) => {
                            warn!("identity: storage returned a blank identifier");
                            self.random(None)
                        }
                        Err(err) => {
                            warn!(error = %err, "identity: storage write failed");
                            self.random(Some(store))
                        }
                    };
                }
                Ok(_) => debug!(strategy = kind.as_str(), "identity: strategy produced nothing"),
                Err(err) => debug!(strategy = kind.as_str(), error = %err, "identity: strategy failed"),
            }
        }

        self.random(Some(store))
    }

    fn random(&self, store: Option<&dyn IdentityStore>) -> IdentityRecord {
        let record = IdentityRecord::new(random_identifier(), DerivationStrategy::FallbackRandom);
        match store.map(|store| store.insert_if_absent(&self.key, &record)) {
            Some(Ok(winner)) if !winner.identifier.trim().is_empty() => winner,
            Some(Ok(_)) => record,
            Some(Err(err)) => {
                debug!(error = %err, "identity: random identifier not persisted");
                record
            }
            None => record,
        }
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_identifier() -> String {
    let millis = Utc::now().timestamp_millis();
    let noise: u64 = rand::thread_rng().gen();
    format!("{}-{}", millis, to_base36(noise))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::tempdir;

    struct Failing;

    impl FingerprintStrategy for Failing {
        fn kind(&self) -> DerivationStrategy {
            DerivationStrategy::Primary
        }

        fn derive(&self) -> Result<String> {
            bail!("blocked")
        }
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
        value: String,
    }

    impl FingerprintStrategy for Counting {
        fn kind(&self) -> DerivationStrategy {
            DerivationStrategy::Primary
        }

        fn derive(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
        }
    }

    struct BrokenStore;

    impl IdentityStore for BrokenStore {
        fn load(&self, _key: &str) -> Result<Option<IdentityRecord>> {
            bail!("disk on fire")
        }

        fn insert_if_absent(&self, _key: &str, _record: &IdentityRecord) -> Result<IdentityRecord> {
            bail!("disk on fire")
        }

        fn remove(&self, _key: &str) -> Result<bool> {
            bail!("disk on fire")
        }
    }

    struct BlankWinner;

    impl IdentityStore for BlankWinner {
        fn load(&self, _key: &str) -> Result<Option<IdentityRecord>> {
            Ok(Some(IdentityRecord::new("", DerivationStrategy::Primary)))
        }

        fn insert_if_absent(&self, _key: &str, _record: &IdentityRecord) -> Result<IdentityRecord> {
            Ok(IdentityRecord::new("", DerivationStrategy::Primary))
        }

        fn remove(&self, _key: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn memory() -> Arc<dyn IdentityStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn stored_value_short_circuits() {
        let store = memory();
        store
            .insert_if_absent("k", &IdentityRecord::new("kept", DerivationStrategy::FallbackHash))
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Provider::new(Some(store), "k").with_strategy(Counting {
            calls: calls.clone(),
            value: "fresh".into(),
        });
        assert_eq!(provider.identifier(), "kept");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn identifier_is_stable_across_calls_and_providers() {
        let store = memory();
        let first = Provider::new(Some(store.clone()), "k")
            .with_strategy(HashFingerprint::new(Signals::default()));
        let id = first.identifier();
        assert_eq!(first.identifier(), id);
        assert_eq!(first.identifier(), id);

        let second = Provider::new(Some(store), "k")
            .with_strategy(HashFingerprint::new(Signals::default()));
        assert_eq!(second.identifier(), id);
    }

    #[test]
    fn hash_fallback_when_primary_fails() {
        let provider = Provider::new(Some(memory()), "k")
            .with_strategy(Failing)
            .with_strategy(HashFingerprint::new(Signals::collect("movievote-test")));
        let record = provider.record();
        assert_eq!(record.strategy, DerivationStrategy::FallbackHash);
        assert_eq!(record.identifier.len(), 64);
        assert!(record.identifier.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn random_when_every_strategy_fails() {
        let provider = Provider::new(Some(memory()), "k").with_strategy(Failing);
        let record = provider.record();
        assert_eq!(record.strategy, DerivationStrategy::FallbackRandom);
        assert!(record.identifier.contains('-'));
        assert_eq!(provider.identifier(), record.identifier);
    }

    #[test]
    fn broken_storage_still_yields_identifier() {
        let provider = Provider::new(Some(Arc::new(BrokenStore)), "k")
            .with_strategy(HashFingerprint::new(Signals::default()));
        let id = provider.identifier();
        assert!(!id.is_empty());
        assert_eq!(provider.record().strategy, DerivationStrategy::FallbackRandom);
        assert_eq!(provider.identifier(), id);
    }

    #[test]
    fn blank_stored_identifier_is_never_returned() {
        let provider = Provider::new(Some(Arc::new(BlankWinner)), "k")
            .with_strategy(HashFingerprint::new(Signals::default()));
        let record = provider.record();
        assert!(!record.identifier.trim().is_empty());
        assert_eq!(record.strategy, DerivationStrategy::FallbackRandom);

        let no_strategies = Provider::new(Some(Arc::new(BlankWinner)), "k");
        assert!(!no_strategies.identifier().trim().is_empty());
    }

    #[test]
    fn no_storage_still_yields_identifier() {
        let provider = Provider::new(None, "k");
        assert!(!provider.identifier().is_empty());
        assert!(!provider.forget().unwrap());
    }

    #[test]
    fn machine_fingerprint_is_deterministic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("machine-id");
        fs::write(&path, "0123456789abcdef\n").unwrap();
        let missing = dir.path().join("missing");
        let strategy = MachineFingerprint::new(vec![missing, path]).with_user("alice");
        let a = strategy.derive().unwrap();
        let b = strategy.derive().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let other = MachineFingerprint::new(vec![dir.path().join("machine-id")]).with_user("bob");
        assert_ne!(other.derive().unwrap(), a);
    }

    #[test]
    fn machine_fingerprint_without_source_fails() {
        let dir = tempdir().unwrap();
        let strategy = MachineFingerprint::new(vec![dir.path().join("nope")]);
        assert!(strategy.derive().is_err());
    }

    #[test]
    fn concurrent_callers_share_one_derivation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(Provider::new(Some(memory()), "k").with_strategy(Counting {
            calls: calls.clone(),
            value: "only-once".into(),
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                thread::spawn(move || provider.identifier())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "only-once");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn racing_providers_converge_on_stored_value() {
        let store = memory();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    Provider::new(Some(store), "k")
                        .with_strategy(HashFingerprint::new(Signals::default()))
                        .identifier()
                })
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.load("k").unwrap().unwrap().identifier, ids[0]);
    }

    #[test]
    fn base36_digits() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
