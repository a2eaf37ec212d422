//! Persistence layer.
//!
//! SQLite behind a single connection. The engine is deliberately
//! single-writer: every access goes through one mutex-guarded connection,
//! which sidesteps SQLite lock contention entirely. Writes are short upserts,
//! so callers may use the store directly from async context.
//!
//! Four tables: the watch list (`domains`), the last observation per domain
//! (`domain_results`), the already-notified log (`notification_history`) and
//! the settings key-value table (`app_settings`).

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::errors::MonitorError;
use crate::{now_local, DomainEntry, DomainResult, LifecycleState, QueryMethod};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS app_settings (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE TABLE IF NOT EXISTS domains (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    notify INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS domain_results (
    domain TEXT PRIMARY KEY,
    state TEXT,
    registrar TEXT,
    last_checked TEXT,
    query_method TEXT,
    created_at TEXT,
    expiry_at TEXT,
    updated_at TEXT,
    name_servers TEXT,
    raw TEXT,
    error_message TEXT,
    created_at_record TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notification_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    state TEXT NOT NULL,
    old_state TEXT,
    sent_at TEXT NOT NULL,
    kind TEXT DEFAULT 'status_change',
    UNIQUE(domain, state)
);
"#;

/// A row in the already-notified log.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub id: i64,
    pub domain: String,
    pub state: LifecycleState,
    pub old_state: Option<LifecycleState>,
    pub sent_at: DateTime<FixedOffset>,
    pub kind: String,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories
    /// as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!("store opened at {}", path.display());
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, MonitorError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-query; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- watch list ------------------------------------------------------

    /// List domains ordered by insertion id.
    pub fn list_domains(&self, enabled_only: bool) -> Result<Vec<DomainEntry>, MonitorError> {
        let conn = self.lock();
        let mut query =
            String::from("SELECT id, name, enabled, notify, created_at FROM domains");
        if enabled_only {
            query.push_str(" WHERE enabled = 1");
        }
        query.push_str(" ORDER BY id ASC");

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            Ok(DomainEntry {
                id: row.get(0)?,
                name: row.get(1)?,
                enabled: row.get::<_, i64>(2)? == 1,
                notify: row.get::<_, i64>(3)? == 1,
                created_at: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Upsert a watch entry by lowercased name.
    pub fn add_domain(&self, name: &str, enabled: bool, notify: bool) -> Result<(), MonitorError> {
        let name = normalize(name);
        if name.is_empty() {
            return Err(MonitorError::InvalidDomain("empty domain".into()));
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO domains(name, enabled, notify, created_at) VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET enabled = excluded.enabled, notify = excluded.notify",
            params![name, enabled as i64, notify as i64, now_local()],
        )?;
        Ok(())
    }

    /// Delete a domain and everything recorded about it, atomically.
    pub fn remove_domain(&self, name: &str) -> Result<(), MonitorError> {
        self.remove_domains(std::slice::from_ref(&name.to_string()))
    }

    /// Batch removal in one transaction.
    pub fn remove_domains(&self, names: &[String]) -> Result<(), MonitorError> {
        let normalized: Vec<String> = names
            .iter()
            .map(|n| normalize(n))
            .filter(|n| !n.is_empty())
            .collect();
        if normalized.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let placeholders = vec!["?"; normalized.len()].join(",");

            let entries = tx.execute(
                &format!("DELETE FROM domains WHERE name IN ({placeholders})"),
                rusqlite::params_from_iter(normalized.iter()),
            )?;
            let results = tx.execute(
                &format!("DELETE FROM domain_results WHERE domain IN ({placeholders})"),
                rusqlite::params_from_iter(normalized.iter()),
            )?;
            let history = tx.execute(
                &format!("DELETE FROM notification_history WHERE domain IN ({placeholders})"),
                rusqlite::params_from_iter(normalized.iter()),
            )?;
            debug!(
                "removed {} domain(s): {entries} entries, {results} results, {history} notifications",
                normalized.len()
            );
        }
        tx.commit()?;
        Ok(())
    }

    // ---- observations ----------------------------------------------------

    /// Upsert an observation. Returns `Ok(false)` without writing when the
    /// stored row already has a newer `last_checked` (stale writes lose).
    pub fn save_result(&self, res: &DomainResult) -> Result<bool, MonitorError> {
        let domain = normalize(&res.domain);
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let stored: Option<DateTime<FixedOffset>> = tx
            .query_row(
                "SELECT last_checked FROM domain_results WHERE domain = ?1",
                params![domain],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(existing) = stored {
            if res.last_checked < existing {
                warn!(
                    "rejecting stale result for {domain}: {} < {existing}",
                    res.last_checked
                );
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT INTO domain_results(domain, state, registrar, last_checked, query_method,
                                        created_at, expiry_at, updated_at, name_servers, raw,
                                        error_message, created_at_record)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(domain) DO UPDATE SET
                 state = excluded.state,
                 registrar = excluded.registrar,
                 last_checked = excluded.last_checked,
                 query_method = excluded.query_method,
                 created_at = excluded.created_at,
                 expiry_at = excluded.expiry_at,
                 updated_at = excluded.updated_at,
                 name_servers = excluded.name_servers,
                 raw = excluded.raw,
                 error_message = excluded.error_message",
            params![
                domain,
                res.state.as_str(),
                res.registrar,
                res.last_checked,
                res.query_method.as_str(),
                res.created_at,
                res.expiry_at,
                res.updated_at,
                res.name_servers.join(","),
                res.raw,
                res.error_message,
                now_local(),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_result(&self, name: &str) -> Result<Option<DomainResult>, MonitorError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT domain, state, registrar, last_checked, query_method, created_at,
                    expiry_at, updated_at, name_servers, COALESCE(raw, ''),
                    COALESCE(error_message, '')
             FROM domain_results WHERE domain = ?1",
            params![normalize(name)],
            row_to_result,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn load_results(&self) -> Result<Vec<DomainResult>, MonitorError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT domain, state, registrar, last_checked, query_method, created_at,
                    expiry_at, updated_at, name_servers, COALESCE(raw, ''),
                    COALESCE(error_message, '')
             FROM domain_results ORDER BY domain ASC",
        )?;
        let rows = stmt.query_map([], row_to_result)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ---- notification log ------------------------------------------------

    /// Record that the user was told about `(domain, state)`. Re-recording
    /// the same pair refreshes `sent_at` and the stored old state.
    pub fn save_notification(
        &self,
        domain: &str,
        state: LifecycleState,
        old_state: LifecycleState,
    ) -> Result<(), MonitorError> {
        let domain = normalize(domain);
        if domain.is_empty() {
            return Err(MonitorError::InvalidDomain("empty domain".into()));
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO notification_history(domain, state, old_state, sent_at, kind)
             VALUES(?1, ?2, ?3, ?4, 'status_change')
             ON CONFLICT(domain, state) DO UPDATE SET
                 sent_at = excluded.sent_at,
                 old_state = excluded.old_state",
            params![domain, state.as_str(), old_state.as_str(), now_local()],
        )?;
        Ok(())
    }

    /// Most recent notification for a domain, if any.
    pub fn get_last_notification(
        &self,
        domain: &str,
    ) -> Result<Option<NotificationRecord>, MonitorError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, domain, state, COALESCE(old_state, ''), sent_at, kind
             FROM notification_history WHERE domain = ?1
             ORDER BY sent_at DESC, id DESC LIMIT 1",
            params![normalize(domain)],
            |row| {
                let old: String = row.get(3)?;
                Ok(NotificationRecord {
                    id: row.get(0)?,
                    domain: row.get(1)?,
                    state: LifecycleState::parse(&row.get::<_, String>(2)?),
                    old_state: if old.is_empty() {
                        None
                    } else {
                        Some(LifecycleState::parse(&old))
                    },
                    sent_at: row.get(4)?,
                    kind: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn has_notified(&self, domain: &str, state: LifecycleState) -> Result<bool, MonitorError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notification_history WHERE domain = ?1 AND state = ?2",
            params![normalize(domain), state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ---- settings --------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, MonitorError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Batch upsert, one transaction.
    pub fn set_settings(&self, entries: &[(&str, &str)]) -> Result<(), MonitorError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO app_settings(key, value) VALUES(?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )?;
            for (key, value) in entries {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ---- garbage collection ----------------------------------------------

    /// Drop observation and notification rows whose domain is no longer
    /// watched. Returns (results deleted, notifications deleted).
    pub fn clean_orphaned(&self) -> Result<(usize, usize), MonitorError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let results = tx.execute(
            "DELETE FROM domain_results WHERE domain NOT IN (SELECT name FROM domains)",
            [],
        )?;
        let history = tx.execute(
            "DELETE FROM notification_history WHERE domain NOT IN (SELECT name FROM domains)",
            [],
        )?;
        tx.commit()?;
        if results > 0 || history > 0 {
            info!("cleaned orphaned rows: {results} results, {history} notifications");
        }
        Ok((results, history))
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<DomainResult> {
    let state: String = row.get(1)?;
    let method: String = row.get(4)?;
    let ns: String = row.get(8)?;
    Ok(DomainResult {
        domain: row.get(0)?,
        state: LifecycleState::parse(&state),
        registrar: row.get(2)?,
        last_checked: row.get(3)?,
        query_method: QueryMethod::parse(&method),
        created_at: row.get(5)?,
        expiry_at: row.get(6)?,
        updated_at: row.get(7)?,
        name_servers: if ns.trim().is_empty() {
            Vec::new()
        } else {
            ns.split(',').map(str::to_string).collect()
        },
        raw: row.get(9)?,
        error_message: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_local;
    use chrono::Duration as ChronoDuration;

    fn sample_result(domain: &str, state: LifecycleState) -> DomainResult {
        DomainResult {
            domain: domain.to_string(),
            state,
            registrar: "Example Registrar".to_string(),
            last_checked: now_local(),
            query_method: QueryMethod::Whois,
            created_at: None,
            expiry_at: None,
            updated_at: None,
            name_servers: vec!["ns1.example.com".into(), "ns2.example.com".into()],
            raw: "Domain Status: ok".to_string(),
            error_message: String::new(),
        }
    }

    #[test]
    fn add_domain_lowercases_the_name() {
        let store = Store::open_in_memory().unwrap();
        store.add_domain("X.EXAMPLE.COM", true, true).unwrap();
        let domains = store.list_domains(false).unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].name, "x.example.com");
        assert!(domains[0].enabled);
        assert!(domains[0].notify);
    }

    #[test]
    fn add_domain_is_an_upsert() {
        let store = Store::open_in_memory().unwrap();
        store.add_domain("a.example.com", true, true).unwrap();
        store.add_domain("a.example.com", false, false).unwrap();
        let domains = store.list_domains(false).unwrap();
        assert_eq!(domains.len(), 1);
        assert!(!domains[0].enabled);
        assert!(!domains[0].notify);
    }

    #[test]
    fn list_domains_keeps_insertion_order() {
        let store = Store::open_in_memory().unwrap();
        for name in ["c.example", "a.example", "b.example"] {
            store.add_domain(name, true, true).unwrap();
        }
        let names: Vec<String> = store
            .list_domains(false)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["c.example", "a.example", "b.example"]);
    }

    #[test]
    fn enabled_only_filters_disabled_entries() {
        let store = Store::open_in_memory().unwrap();
        store.add_domain("on.example", true, true).unwrap();
        store.add_domain("off.example", false, true).unwrap();
        let names: Vec<String> = store
            .list_domains(true)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["on.example"]);
    }

    #[test]
    fn save_result_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let res = sample_result("roundtrip.example", LifecycleState::Registered);
        assert!(store.save_result(&res).unwrap());

        let loaded = store.get_result("roundtrip.example").unwrap().unwrap();
        assert_eq!(loaded.state, LifecycleState::Registered);
        assert_eq!(loaded.registrar, "Example Registrar");
        assert_eq!(loaded.name_servers, res.name_servers);
        assert_eq!(loaded.raw, "Domain Status: ok");
        assert_eq!(loaded.last_checked, res.last_checked);
    }

    #[test]
    fn stale_write_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let fresh = sample_result("mono.example", LifecycleState::Registered);
        assert!(store.save_result(&fresh).unwrap());

        let mut stale = sample_result("mono.example", LifecycleState::Available);
        stale.last_checked = fresh.last_checked - ChronoDuration::seconds(60);
        assert!(!store.save_result(&stale).unwrap());

        let stored = store.get_result("mono.example").unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Registered);
    }

    #[test]
    fn remove_domains_cascades_across_tables() {
        let store = Store::open_in_memory().unwrap();
        for name in ["a.example", "b.example", "keep.example"] {
            store.add_domain(name, true, true).unwrap();
            store
                .save_result(&sample_result(name, LifecycleState::Registered))
                .unwrap();
            store
                .save_notification(name, LifecycleState::Redemption, LifecycleState::Registered)
                .unwrap();
        }

        store
            .remove_domains(&["a.example".to_string(), "b.example".to_string()])
            .unwrap();

        for gone in ["a.example", "b.example"] {
            assert!(store.get_result(gone).unwrap().is_none());
            assert!(store.get_last_notification(gone).unwrap().is_none());
        }
        assert_eq!(store.list_domains(false).unwrap().len(), 1);
        assert!(store.get_result("keep.example").unwrap().is_some());
    }

    #[test]
    fn notification_upsert_is_unique_per_domain_and_state() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_notification("n.example", LifecycleState::Redemption, LifecycleState::Registered)
            .unwrap();
        store
            .save_notification("n.example", LifecycleState::Redemption, LifecycleState::Grace)
            .unwrap();

        let last = store.get_last_notification("n.example").unwrap().unwrap();
        assert_eq!(last.state, LifecycleState::Redemption);
        assert_eq!(last.old_state, Some(LifecycleState::Grace));
        assert!(store
            .has_notified("n.example", LifecycleState::Redemption)
            .unwrap());
        assert!(!store
            .has_notified("n.example", LifecycleState::Available)
            .unwrap());
    }

    #[test]
    fn clean_orphaned_removes_rows_without_entries() {
        let store = Store::open_in_memory().unwrap();
        store.add_domain("kept.example", true, true).unwrap();
        store
            .save_result(&sample_result("kept.example", LifecycleState::Registered))
            .unwrap();
        store
            .save_result(&sample_result("orphan.example", LifecycleState::Available))
            .unwrap();
        store
            .save_notification("orphan.example", LifecycleState::Available, LifecycleState::Registered)
            .unwrap();

        let (results, history) = store.clean_orphaned().unwrap();
        assert_eq!(results, 1);
        assert_eq!(history, 1);
        assert!(store.get_result("kept.example").unwrap().is_some());
        assert!(store.get_result("orphan.example").unwrap().is_none());
    }

    #[test]
    fn settings_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_settings(&[("monitor_check_interval", "600"), ("monitor_timeout", "20")])
            .unwrap();
        assert_eq!(
            store.get_setting("monitor_check_interval").unwrap(),
            Some("600".to_string())
        );
        assert_eq!(store.get_setting("missing").unwrap(), None);

        store.set_settings(&[("monitor_timeout", "30")]).unwrap();
        assert_eq!(
            store.get_setting("monitor_timeout").unwrap(),
            Some("30".to_string())
        );
    }
}
