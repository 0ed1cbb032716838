//! Admission control for incoming chat messages.
//!
//! Identities come from the platform (`sender_id`) and are matched verbatim
//! after trimming. The allow-list is the union of the static list from config,
//! runtime grants, and an optional file with one identity per line (`#` starts
//! a comment). The file is re-read at most once per cache TTL; inside a tokio
//! runtime the re-read runs on the blocking pool and lookups keep answering
//! from the cached copy meanwhile.

use crate::config::{AccessMode, AuthorizationConfig};
use dashmap::DashSet;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

const MAX_IDENTITY_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReason {
    Open,
    Admin,
    AllowListed,
    NotAllowListed,
    InvalidIdentity,
    /// The allow-list store could not be consulted; fail closed.
    Unavailable(String),
}

impl fmt::Display for AuthReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Admin => f.write_str("admin"),
            Self::AllowListed => f.write_str("allow_listed"),
            Self::NotAllowListed => f.write_str("not_allow_listed"),
            Self::InvalidIdentity => f.write_str("invalid_identity"),
            Self::Unavailable(detail) => write!(f, "unavailable: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthDecision {
    pub identity: String,
    pub allowed: bool,
    pub reason: AuthReason,
}

impl AuthDecision {
    fn allow(identity: String, reason: AuthReason) -> Self {
        Self {
            identity,
            allowed: true,
            reason,
        }
    }

    fn deny(identity: String, reason: AuthReason) -> Self {
        Self {
            identity,
            allowed: false,
            reason,
        }
    }
}

/// Decides whether an identity may submit requests. Must be safe to call
/// from many tasks at once.
pub trait Authorizer: Send + Sync {
    /// Startup check; an error aborts startup.
    fn ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn authorize(&self, identity: &str) -> AuthDecision;
}

#[derive(Debug)]
struct CachedList {
    users: HashSet<String>,
    checked_at: Instant,
}

#[derive(Debug)]
struct AllowListFile {
    path: PathBuf,
    ttl: Duration,
    cache: RwLock<Option<CachedList>>,
    refreshing: AtomicBool,
}

impl AllowListFile {
    fn read_cache(&self) -> RwLockReadGuard<'_, Option<CachedList>> {
        self.cache.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, Option<CachedList>> {
        self.cache.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Looks `identity` up in the cached copy, scheduling a refresh when it
    /// is stale. Fails only when no copy has ever been loaded.
    fn contains(self: &Arc<Self>, identity: &str) -> Result<bool, String> {
        let stale = match self.read_cache().as_ref() {
            Some(cached) => cached.checked_at.elapsed() >= self.ttl,
            None => true,
        };
        if stale {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => self.schedule_refresh(&handle),
                Err(_) => self.refresh(),
            }
        }

        match self.read_cache().as_ref() {
            Some(cached) => Ok(cached.users.contains(identity)),
            None => Err(format!("allow-list {} could not be read", self.path.display())),
        }
    }

    /// At most one refresh is in flight at a time.
    fn schedule_refresh(self: &Arc<Self>, handle: &tokio::runtime::Handle) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let file = Arc::clone(self);
        handle.spawn_blocking(move || {
            file.refresh();
            file.refreshing.store(false, Ordering::Release);
        });
    }

    fn refresh(&self) {
        match read_allowlist(&self.path) {
            Ok(users) => {
                tracing::debug!(path = %self.path.display(), entries = users.len(), "allow-list refreshed");
                *self.write_cache() = Some(CachedList {
                    users,
                    checked_at: Instant::now(),
                });
            }
            Err(e) => {
                let mut cache = self.write_cache();
                match cache.as_mut() {
                    Some(stale) => {
                        tracing::warn!(path = %self.path.display(), error = %e, "allow-list refresh failed; using cached copy");
                        stale.checked_at = Instant::now();
                    }
                    None => {
                        tracing::error!(path = %self.path.display(), error = %e, "allow-list unreadable");
                    }
                }
            }
        }
    }

    fn load_now(&self) -> std::io::Result<usize> {
        let users = read_allowlist(&self.path)?;
        let count = users.len();
        *self.write_cache() = Some(CachedList {
            users,
            checked_at: Instant::now(),
        });
        Ok(count)
    }
}

fn read_allowlist(path: &Path) -> std::io::Result<HashSet<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter_map(|line| normalize_identity(line).ok())
        .collect())
}

fn normalize_identity(value: &str) -> Result<String, AuthReason> {
    let normalized = value.trim();
    if normalized.is_empty() || normalized.len() > MAX_IDENTITY_LEN {
        return Err(AuthReason::InvalidIdentity);
    }
    if normalized.chars().any(char::is_control) {
        return Err(AuthReason::InvalidIdentity);
    }
    Ok(normalized.to_string())
}

#[derive(Debug)]
pub struct AllowListAuthorizer {
    mode: AccessMode,
    admins: DashSet<String>,
    allowed: DashSet<String>,
    file: Option<Arc<AllowListFile>>,
}

impl AllowListAuthorizer {
    pub fn new(mode: AccessMode) -> Self {
        Self {
            mode,
            admins: DashSet::new(),
            allowed: DashSet::new(),
            file: None,
        }
    }

    pub fn from_config(cfg: &AuthorizationConfig) -> Self {
        let mut authorizer = Self::new(cfg.mode);
        for admin in &cfg.admins {
            authorizer.add_admin(admin);
        }
        for user in &cfg.allowed_users {
            authorizer.grant(user);
        }
        if let Some(path) = &cfg.allowlist_path {
            authorizer = authorizer.with_file(path.clone(), Duration::from_millis(cfg.cache_ttl_ms));
        }
        authorizer
    }

    pub fn with_file(mut self, path: PathBuf, ttl: Duration) -> Self {
        self.file = Some(Arc::new(AllowListFile {
            path,
            ttl,
            cache: RwLock::new(None),
            refreshing: AtomicBool::new(false),
        }));
        self
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn add_admin(&self, identity: &str) -> bool {
        match normalize_identity(identity) {
            Ok(id) => self.admins.insert(id),
            Err(_) => {
                tracing::warn!(identity, "ignoring invalid admin identity");
                false
            }
        }
    }

    /// Adds `identity` to the runtime allow-list. Returns false if it was
    /// already present or is not a valid identity.
    pub fn grant(&self, identity: &str) -> bool {
        match normalize_identity(identity) {
            Ok(id) => {
                let added = self.allowed.insert(id);
                if added {
                    tracing::info!(identity, "identity granted");
                }
                added
            }
            Err(_) => {
                tracing::warn!(identity, "ignoring invalid identity");
                false
            }
        }
    }

    pub fn revoke(&self, identity: &str) -> bool {
        let removed = self.allowed.remove(identity.trim()).is_some();
        if removed {
            tracing::info!(identity, "identity revoked");
        }
        removed
    }
}

impl Authorizer for AllowListAuthorizer {
    fn ready(&self) -> anyhow::Result<()> {
        if let Some(file) = &self.file {
            let count = file
                .load_now()
                .map_err(|e| anyhow::anyhow!("read allow-list {}: {e}", file.path.display()))?;
            tracing::info!(path = %file.path.display(), entries = count, "allow-list loaded");
        }
        tracing::info!(
            mode = ?self.mode,
            admins = self.admins.len(),
            allowed = self.allowed.len(),
            "authorizer ready"
        );
        Ok(())
    }

    fn authorize(&self, identity: &str) -> AuthDecision {
        let id = match normalize_identity(identity) {
            Ok(id) => id,
            Err(reason) => return AuthDecision::deny(identity.to_string(), reason),
        };

        if self.admins.contains(&id) {
            return AuthDecision::allow(id, AuthReason::Admin);
        }
        if self.mode == AccessMode::Open {
            return AuthDecision::allow(id, AuthReason::Open);
        }
        if self.allowed.contains(&id) {
            return AuthDecision::allow(id, AuthReason::AllowListed);
        }

        match &self.file {
            Some(file) => match file.contains(&id) {
                Ok(true) => AuthDecision::allow(id, AuthReason::AllowListed),
                Ok(false) => AuthDecision::deny(id, AuthReason::NotAllowListed),
                Err(detail) => AuthDecision::deny(id, AuthReason::Unavailable(detail)),
            },
            None => AuthDecision::deny(id, AuthReason::NotAllowListed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(users: &[&str]) -> AllowListAuthorizer {
        let authorizer = AllowListAuthorizer::new(AccessMode::Allowlist);
        for user in users {
            authorizer.grant(user);
        }
        authorizer
    }

    #[test]
    fn allow_list_admits_only_listed_identities() {
        let authorizer = allowlist(&["42"]);
        let ok = authorizer.authorize(" 42 ");
        assert!(ok.allowed);
        assert_eq!(ok.identity, "42");
        assert_eq!(ok.reason, AuthReason::AllowListed);

        let denied = authorizer.authorize("43");
        assert!(!denied.allowed);
        assert_eq!(denied.reason, AuthReason::NotAllowListed);
    }

    #[test]
    fn open_mode_still_rejects_malformed_identities() {
        let authorizer = AllowListAuthorizer::new(AccessMode::Open);
        assert_eq!(authorizer.authorize("7").reason, AuthReason::Open);
        let too_long = "x".repeat(MAX_IDENTITY_LEN + 1);
        for bad in ["", "   ", "a\u{0}b", too_long.as_str()] {
            let decision = authorizer.authorize(bad);
            assert!(!decision.allowed, "{bad:?} should be rejected");
            assert_eq!(decision.reason, AuthReason::InvalidIdentity);
        }
    }

    #[test]
    fn admins_are_always_allowed() {
        let cfg = AuthorizationConfig {
            admins: vec!["1".to_string()],
            ..AuthorizationConfig::default()
        };
        let authorizer = AllowListAuthorizer::from_config(&cfg);
        authorizer.ready().expect("ready");
        assert_eq!(authorizer.authorize("1").reason, AuthReason::Admin);
        assert!(!authorizer.authorize("2").allowed);
    }

    #[test]
    fn grant_and_revoke_take_effect_immediately() {
        let authorizer = allowlist(&[]);
        assert!(!authorizer.authorize("5").allowed);
        assert!(authorizer.grant("5"));
        assert!(!authorizer.grant("5"));
        assert!(authorizer.authorize("5").allowed);
        assert!(authorizer.revoke("5"));
        assert!(!authorizer.authorize("5").allowed);
        assert!(!authorizer.grant("bad\nid"));
    }

    #[test]
    fn file_entries_are_read_and_comments_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("allowed.txt");
        std::fs::write(&path, "# team\n100\n  200  # bob\n\n").expect("write");

        let authorizer = allowlist(&[]).with_file(path, Duration::from_secs(60));
        authorizer.ready().expect("ready");
        assert!(authorizer.authorize("100").allowed);
        assert!(authorizer.authorize("200").allowed);
        assert_eq!(authorizer.authorize("300").reason, AuthReason::NotAllowListed);
    }

    #[test]
    fn file_is_refreshed_after_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("allowed.txt");
        std::fs::write(&path, "100\n").expect("write");

        let authorizer = allowlist(&[]).with_file(path.clone(), Duration::ZERO);
        assert!(!authorizer.authorize("200").allowed);
        std::fs::write(&path, "100\n200\n").expect("rewrite");
        assert!(authorizer.authorize("200").allowed);
    }

    #[test]
    fn unreadable_store_fails_closed_without_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.txt");
        let authorizer = allowlist(&[]).with_file(path, Duration::from_secs(60));

        assert!(authorizer.ready().is_err());
        let decision = authorizer.authorize("100");
        assert!(!decision.allowed);
        assert!(matches!(decision.reason, AuthReason::Unavailable(_)));
    }

    #[test]
    fn stale_cache_is_used_when_refresh_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("allowed.txt");
        std::fs::write(&path, "100\n").expect("write");

        let authorizer = allowlist(&[]).with_file(path.clone(), Duration::ZERO);
        authorizer.ready().expect("ready");
        std::fs::remove_file(&path).expect("remove");

        assert!(authorizer.authorize("100").allowed);
        assert_eq!(authorizer.authorize("200").reason, AuthReason::NotAllowListed);
    }

    #[tokio::test]
    async fn runtime_lookups_answer_from_cache_while_refreshing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("allowed.txt");
        std::fs::write(&path, "100\n").expect("write");

        let authorizer = allowlist(&[]).with_file(path.clone(), Duration::ZERO);
        authorizer.ready().expect("ready");
        std::fs::write(&path, "100\n200\n").expect("rewrite");

        // The stale copy answers immediately; the re-read lands shortly after.
        assert_eq!(authorizer.authorize("200").reason, AuthReason::NotAllowListed);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !authorizer.authorize("200").allowed {
            assert!(Instant::now() < deadline, "allow-list was never refreshed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(authorizer.authorize("100").allowed);
    }

    #[tokio::test]
    async fn runtime_lookup_without_cache_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let authorizer = allowlist(&[]).with_file(dir.path().join("missing.txt"), Duration::from_secs(60));
        let decision = authorizer.authorize("100");
        assert!(!decision.allowed);
        assert!(matches!(decision.reason, AuthReason::Unavailable(_)));
    }

    #[test]
    fn concurrent_authorize_and_grant() {
        let authorizer = Arc::new(allowlist(&["0"]));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let authorizer = Arc::clone(&authorizer);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("{t}-{i}");
                        authorizer.grant(&id);
                        assert!(authorizer.authorize(&id).allowed);
                        assert!(authorizer.authorize("0").allowed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
    }
}
