//! Connection lifecycle manager.
//!
//! Facade over the [`ConfigStore`], the attempt [`Store`] and the
//! [`Dialer`]. It creates pending attempts, opens connections for probers,
//! and records the outcomes they report.
//!
//! Each attempt moves `pending -> success | failed`. Re-resolving an attempt
//! is allowed; keeping transitions forward-only is up to the caller. Two
//! concurrent updates of the same id are last-write-wins.

use crate::config::{ConfigError, ConfigStore, RuntimeConfig};
use crate::db::{ConnectionAttempt, DbError, NewAttempt, Status, Store};
use crate::dialer::{DialContext, DialError, Dialer, Target};

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;

/// Manager error types.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Dial(#[from] DialError),
}

/// Outcome a prober reports for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: Status,
    pub message: String,
    pub result: String,
    pub logs: Vec<String>,
}

/// Owns attempt bookkeeping and dial resolution.
pub struct ConnectionManager {
    config: Arc<ConfigStore>,
    store: Store,
}

impl ConnectionManager {
    pub fn new(config: Arc<ConfigStore>, store: Store) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // --- Attempt CRUD ---

    /// Record a new pending attempt. Does not dial.
    pub fn create(&self, target: NewAttempt) -> Result<ConnectionAttempt, ManagerError> {
        let attempt = ConnectionAttempt::new(target);
        self.store.insert_attempt(&attempt)?;
        tracing::info!(
            "Created attempt {} ({} {}:{})",
            attempt.id,
            attempt.kind,
            attempt.host,
            attempt.port
        );
        Ok(attempt)
    }

    /// Record one pending attempt per target, all in one transaction.
    pub fn create_batch(&self, targets: Vec<NewAttempt>) -> Result<Vec<ConnectionAttempt>, ManagerError> {
        let attempts: Vec<_> = targets.into_iter().map(ConnectionAttempt::new).collect();
        self.store.insert_attempts(&attempts)?;
        if !attempts.is_empty() {
            tracing::info!("Created {} attempts", attempts.len());
        }
        Ok(attempts)
    }

    /// Look up an attempt. A missing id is `Ok(None)`, not an error.
    pub fn get(&self, id: &str) -> Result<Option<ConnectionAttempt>, ManagerError> {
        Ok(self.store.get_attempt(id)?)
    }

    /// All attempts, newest first.
    pub fn list(&self) -> Result<Vec<ConnectionAttempt>, ManagerError> {
        Ok(self.store.get_attempts()?)
    }

    /// Attempts of one type, newest first.
    pub fn list_by_type(&self, kind: &str) -> Result<Vec<ConnectionAttempt>, ManagerError> {
        Ok(self.store.get_attempts_by_type(kind)?)
    }

    /// Attempts in one status, newest first.
    pub fn list_by_status(&self, status: &Status) -> Result<Vec<ConnectionAttempt>, ManagerError> {
        Ok(self.store.get_attempts_by_status(status)?)
    }

    /// Replace the outcome fields (status, message, result, logs,
    /// connected_at) of an existing attempt. Returns whether the id exists.
    ///
    /// A resolved attempt without `connected_at` is stamped with the current
    /// time; a pending one has it cleared.
    pub fn update(&self, attempt: &mut ConnectionAttempt) -> Result<bool, ManagerError> {
        if attempt.status.is_pending() {
            attempt.connected_at = None;
        } else if attempt.connected_at.is_none() {
            attempt.connected_at = Some(Utc::now());
        }

        let found = self.store.update_attempt(attempt)?;
        if found {
            tracing::info!("Attempt {} is now {}", attempt.id, attempt.status);
        } else {
            tracing::warn!("Update for unknown attempt {}", attempt.id);
        }
        Ok(found)
    }

    /// Apply a prober's outcome to the stored attempt `id`.
    /// Returns the updated attempt, or `None` when the id does not exist.
    pub fn resolve(&self, id: &str, outcome: Outcome) -> Result<Option<ConnectionAttempt>, ManagerError> {
        let mut attempt = match self.store.get_attempt(id)? {
            Some(a) => a,
            None => return Ok(None),
        };

        attempt.status = outcome.status;
        attempt.message = outcome.message;
        attempt.result = outcome.result;
        attempt.logs = outcome.logs;
        attempt.connected_at = None;

        if self.update(&mut attempt)? {
            Ok(Some(attempt))
        } else {
            Ok(None)
        }
    }

    /// Correct the descriptive fields without touching status or logs.
    /// Returns whether the id exists.
    pub fn update_info(&self, id: &str, info: &NewAttempt) -> Result<bool, ManagerError> {
        Ok(self.store.update_attempt_info(id, info)?)
    }

    /// Delete one attempt. Returns whether a row was removed.
    pub fn delete(&self, id: &str) -> Result<bool, ManagerError> {
        let removed = self.store.delete_attempt(id)?;
        if removed {
            tracing::info!("Deleted attempt {}", id);
        }
        Ok(removed)
    }

    /// Delete many attempts atomically. Returns how many rows were removed,
    /// which is below `ids.len()` when some ids did not exist.
    pub fn delete_batch(&self, ids: &[String]) -> Result<usize, ManagerError> {
        let removed = self.store.delete_attempts(ids)?;
        if removed > 0 {
            tracing::info!("Deleted {} of {} requested attempts", removed, ids.len());
        }
        Ok(removed)
    }

    // --- Dialing ---

    /// Resolve the dialer for the current configuration.
    pub fn dialer(&self) -> Result<Dialer, ManagerError> {
        let cfg: Arc<RuntimeConfig> = self.config.get()?;
        Ok(Dialer::from_config(&cfg)?)
    }

    /// Open a connection to the attempt's target using the current config.
    pub async fn dial(&self, attempt: &ConnectionAttempt) -> Result<TcpStream, ManagerError> {
        self.dial_context(attempt, DialContext::background()).await
    }

    /// Like [`ConnectionManager::dial`], bounded by the context's deadline and cancellation.
    pub async fn dial_context(
        &self,
        attempt: &ConnectionAttempt,
        ctx: DialContext,
    ) -> Result<TcpStream, ManagerError> {
        let dialer = self.dialer()?;
        self.dial_with(&dialer, attempt, ctx).await
    }

    /// Dial through an already resolved `dialer`, for callers that report its route.
    pub async fn dial_with(
        &self,
        dialer: &Dialer,
        attempt: &ConnectionAttempt,
        ctx: DialContext,
    ) -> Result<TcpStream, ManagerError> {
        let target = Target::parse(&attempt.host, &attempt.port)?;
        Ok(dialer.dial_context(&target, ctx).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use tempfile::{tempdir, TempDir};

    fn manager() -> (TempDir, ConnectionManager) {
        manager_with(RuntimeConfig::default())
    }

    fn manager_with(cfg: RuntimeConfig) -> (TempDir, ConnectionManager) {
        let dir = tempdir().unwrap();
        let config = Arc::new(ConfigStore::with_config(dir.path().join("config.json"), cfg));
        let store = Store::new(dir.path().join("connections.db")).unwrap();
        (dir, ConnectionManager::new(config, store))
    }

    #[test]
    fn test_create_then_resolve_scenario() {
        let (_dir, mgr) = manager();

        let created = mgr.create(NewAttempt::new("ssh", "10.0.0.5", "22", "", "")).unwrap();
        assert_eq!(created.status, Status::Pending);
        assert!(created.connected_at.is_none());

        let mut fetched = mgr.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched.status, Status::Pending);

        fetched.status = Status::Success;
        fetched.logs = vec!["connected".to_string()];
        assert!(mgr.update(&mut fetched).unwrap());

        let after = mgr.get(&created.id).unwrap().unwrap();
        assert_eq!(after.status, Status::Success);
        assert!(after.connected_at.is_some());
        assert_eq!(after.logs, vec!["connected"]);
    }

    #[test]
    fn test_get_missing_is_none() {
        let (_dir, mgr) = manager();
        assert!(mgr.get("no-such-id").unwrap().is_none());
    }

    #[test]
    fn test_update_clears_connected_at_while_pending() {
        let (_dir, mgr) = manager();
        let mut a = mgr.create(NewAttempt::new("ssh", "h", "22", "", "")).unwrap();
        a.connected_at = Some(Utc::now());
        assert!(mgr.update(&mut a).unwrap());
        assert!(mgr.get(&a.id).unwrap().unwrap().connected_at.is_none());
    }

    #[test]
    fn test_update_unknown_id_reports_false() {
        let (_dir, mgr) = manager();
        let mut a = ConnectionAttempt::new(NewAttempt::new("ssh", "h", "22", "", ""));
        a.status = Status::Failed;
        assert!(!mgr.update(&mut a).unwrap());
    }

    #[test]
    fn test_resolve_applies_outcome() {
        let (_dir, mgr) = manager();
        let a = mgr.create(NewAttempt::new("ftp", "h", "21", "anonymous", "")).unwrap();

        let outcome = Outcome {
            status: Status::Failed,
            message: "login refused".to_string(),
            result: String::new(),
            logs: vec!["dial ok".to_string(), "530".to_string()],
        };
        let resolved = mgr.resolve(&a.id, outcome.clone()).unwrap().unwrap();
        assert_eq!(resolved.status, Status::Failed);
        assert!(resolved.connected_at.is_some());
        assert_eq!(mgr.get(&a.id).unwrap().unwrap().message, "login refused");

        assert!(mgr.resolve("missing", outcome).unwrap().is_none());
    }

    #[test]
    fn test_update_info_keeps_outcome() {
        let (_dir, mgr) = manager();
        let mut a = mgr.create(NewAttempt::new("ssh", "h", "22", "", "")).unwrap();
        a.status = Status::Success;
        a.logs = vec!["ok".to_string()];
        mgr.update(&mut a).unwrap();

        let info = NewAttempt::new("ssh", "h2", "2222", "root", "pw");
        assert!(mgr.update_info(&a.id, &info).unwrap());
        assert!(!mgr.update_info("missing", &info).unwrap());

        let after = mgr.get(&a.id).unwrap().unwrap();
        assert_eq!(after.host, "h2");
        assert_eq!(after.user, "root");
        assert_eq!(after.status, Status::Success);
        assert_eq!(after.logs, vec!["ok"]);
    }

    #[test]
    fn test_list_by_type() {
        let (_dir, mgr) = manager();
        let ssh = mgr.create(NewAttempt::new("ssh", "10.0.0.1", "22", "", "")).unwrap();
        mgr.create(NewAttempt::new("rdp", "10.0.0.2", "3389", "", "")).unwrap();

        let listed = mgr.list_by_type("ssh").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, ssh.id);
        assert_eq!(mgr.list().unwrap().len(), 2);
        assert_eq!(mgr.list_by_status(&Status::Pending).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, mgr) = manager();
        let a = mgr.create(NewAttempt::new("ssh", "h", "22", "", "")).unwrap();
        assert!(mgr.delete(&a.id).unwrap());
        assert!(!mgr.delete(&a.id).unwrap());
    }

    #[test]
    fn test_delete_batch_counts_removed_rows() {
        let (_dir, mgr) = manager();
        assert_eq!(mgr.delete_batch(&[]).unwrap(), 0);

        let a = mgr.create(NewAttempt::new("ssh", "h", "22", "", "")).unwrap();
        let removed = mgr.delete_batch(&[a.id.clone(), "ghost".to_string()]).unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_create_batch() {
        let (_dir, mgr) = manager();
        assert!(mgr.create_batch(Vec::new()).unwrap().is_empty());

        let created = mgr
            .create_batch(vec![
                NewAttempt::new("ssh", "10.0.0.1", "22", "root", "a"),
                NewAttempt::new("ftp", "10.0.0.2", "21", "ftp", "b"),
            ])
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].kind, "ftp");
        assert!(created.iter().all(|a| a.status == Status::Pending));
        assert_eq!(mgr.list().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_creates() {
        let (_dir, mgr) = manager();
        let mgr = Arc::new(mgr);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let mgr = mgr.clone();
                std::thread::spawn(move || {
                    for n in 0..10 {
                        mgr.create(NewAttempt::new("ssh", &format!("10.0.{}.{}", i, n), "22", "", ""))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(mgr.list().unwrap().len(), 40);
    }

    #[test]
    fn test_dialer_follows_config_changes() {
        let (_dir, mgr) = manager();
        assert!(matches!(mgr.dialer().unwrap(), Dialer::Direct(_)));

        let cfg = RuntimeConfig {
            proxy: ProxyConfig {
                enabled: true,
                proxy_type: "http".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        mgr.config().save(cfg).unwrap();
        assert!(matches!(
            mgr.dialer(),
            Err(ManagerError::Dial(DialError::UnsupportedProxy(_)))
        ));
    }

    #[tokio::test]
    async fn test_dial_rejects_bad_port() {
        let (_dir, mgr) = manager();
        let a = mgr.create(NewAttempt::new("ssh", "127.0.0.1", "not-a-port", "", "")).unwrap();
        let err = mgr.dial(&a).await.unwrap_err();
        assert!(matches!(err, ManagerError::Dial(DialError::InvalidPort(_))));
    }

    #[tokio::test]
    async fn test_dial_connects_to_target() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (_dir, mgr) = manager();
        let a = mgr
            .create(NewAttempt::new("tcp", "127.0.0.1", &port.to_string(), "", ""))
            .unwrap();
        let stream = mgr.dial(&a).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_dial_with_uses_the_given_dialer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (_dir, mgr) = manager();
        let a = mgr
            .create(NewAttempt::new("tcp", "127.0.0.1", &port.to_string(), "", ""))
            .unwrap();
        let dialer = mgr.dialer().unwrap();

        // switch to a proxy after the dialer was resolved
        let mut cfg = (*mgr.config().get().unwrap()).clone();
        cfg.proxy = ProxyConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: "1".to_string(),
            ..Default::default()
        };
        mgr.config().save(cfg).unwrap();

        let stream = mgr
            .dial_with(&dialer, &a, DialContext::background())
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        assert!(mgr.dial(&a).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_with_misconfigured_proxy_fails_fast() {
        let cfg = RuntimeConfig {
            proxy: ProxyConfig {
                enabled: true,
                host: String::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        let (_dir, mgr) = manager_with(cfg);
        let a = mgr.create(NewAttempt::new("ssh", "10.0.0.5", "22", "", "")).unwrap();

        let err = mgr.dial(&a).await.unwrap_err();
        assert!(matches!(err, ManagerError::Dial(DialError::InvalidProxy(_))));
    }
}
