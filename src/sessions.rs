//! In-memory presence tracking and the upload gate.
//!
//! Sessions are deliberately ephemeral: a restart logs everyone out.
//! A session expires after five minutes without a heartbeat, at which point
//! the user moves to the logout history so the dashboard can show when they
//! were last seen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

/// Inactivity window before a session expires.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// How often the background sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// How long presence queries wait for an in-flight import to finish.
pub const IMPORT_WAIT: Duration = Duration::from_secs(5 * 60);

/// One live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// When the user logged in.
    pub login_time: DateTime<Utc>,
    /// Last heartbeat or authenticated action.
    pub last_activity: DateTime<Utc>,
}

/// Presence snapshot handed to the dashboard.
#[derive(Debug, Serialize)]
pub struct PresenceSnapshot {
    /// Users currently online, sorted by name.
    pub online: Vec<String>,
    /// Live session details keyed by user name.
    pub sessions: HashMap<String, SessionInfo>,
    /// Last-logout timestamps for users not currently online.
    pub logged_out: HashMap<String, DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    active: HashMap<String, SessionInfo>,
    logged_out: HashMap<String, DateTime<Utc>>,
}

/// Tracks who is online. All methods take `&self`, the tracker is shared
/// behind an `Arc` in the application state.
#[derive(Default)]
pub struct SessionTracker {
    inner: RwLock<Inner>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a login, replacing any previous session for the name.
    pub fn login(&self, nome: &str) {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();
        inner.logged_out.remove(nome);
        inner.active.insert(
            nome.to_string(),
            SessionInfo {
                login_time: now,
                last_activity: now,
            },
        );
        log::info!("Session opened for '{}'", nome);
    }

    /// Ends a session and records the logout time.
    pub fn logout(&self, nome: &str) {
        let mut inner = self.inner.write().unwrap();
        if inner.active.remove(nome).is_some() {
            inner.logged_out.insert(nome.to_string(), Utc::now());
            log::info!("Session closed for '{}'", nome);
        }
    }

    /// Refreshes the activity timestamp. Returns false for unknown users,
    /// whose session has expired or never existed.
    pub fn heartbeat(&self, nome: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.active.get_mut(nome) {
            Some(session) => {
                session.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Carries a session and logout history over to a new user name.
    /// Used when an administrator renames a designer.
    pub fn rename(&self, old: &str, new: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(session) = inner.active.remove(old) {
            inner.active.insert(new.to_string(), session);
        }
        if let Some(ts) = inner.logged_out.remove(old) {
            inner.logged_out.insert(new.to_string(), ts);
        }
    }

    /// Expires sessions idle past the timeout, moving them to the logout
    /// history. Returns how many expired.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(SESSION_TIMEOUT).unwrap();
        let mut inner = self.inner.write().unwrap();
        let expired: Vec<String> = inner
            .active
            .iter()
            .filter(|(_, s)| now - s.last_activity > cutoff)
            .map(|(nome, _)| nome.clone())
            .collect();
        for nome in &expired {
            if let Some(session) = inner.active.remove(nome) {
                inner.logged_out.insert(nome.clone(), session.last_activity);
                log::info!("Session for '{}' expired by inactivity", nome);
            }
        }
        expired.len()
    }

    /// Current presence, with expired sessions swept first.
    pub fn snapshot(&self) -> PresenceSnapshot {
        self.sweep();
        let inner = self.inner.read().unwrap();
        let mut online: Vec<String> = inner.active.keys().cloned().collect();
        online.sort();
        PresenceSnapshot {
            online,
            sessions: inner.active.clone(),
            logged_out: inner.logged_out.clone(),
        }
    }

    /// Whether the user has a live session.
    pub fn is_online(&self, nome: &str) -> bool {
        self.inner.read().unwrap().active.contains_key(nome)
    }
}

/// Signals that a dataset import is running so presence queries can wait
/// for it instead of timing out against a busy server.
///
/// Holds a count rather than a flag: the gate only reopens once every
/// outstanding permit has been dropped.
#[derive(Default)]
pub struct ImportGate {
    running: AtomicUsize,
    notify: Notify,
}

/// Held while an import runs; releases the gate on drop so a panicking
/// import task cannot leave it closed.
pub struct ImportPermit {
    gate: Arc<ImportGate>,
}

impl ImportGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an import as running.
    pub fn begin(self: &Arc<Self>) -> ImportPermit {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("Import gate closed ({} running)", running);
        ImportPermit { gate: self.clone() }
    }

    /// Whether any import is currently running.
    pub fn is_busy(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }

    /// Waits until no import is running, up to `wait`. Returns false when
    /// the wait expired with the gate still closed.
    pub async fn wait_idle(&self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        while self.is_busy() {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            // Short bound per wait so a notification racing the busy check
            // costs at most one iteration.
            let step = (deadline - now).min(Duration::from_millis(250));
            let _ = tokio::time::timeout(step, self.notify.notified()).await;
        }
        true
    }
}

impl Drop for ImportPermit {
    fn drop(&mut self) {
        if self.gate.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gate.notify.notify_waiters();
            log::info!("Import gate opened");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_heartbeat_logout_cycle() {
        let tracker = SessionTracker::new();
        tracker.login("ana");
        assert!(tracker.is_online("ana"));
        assert!(tracker.heartbeat("ana"));

        tracker.logout("ana");
        assert!(!tracker.is_online("ana"));
        assert!(!tracker.heartbeat("ana"));
        let snap = tracker.snapshot();
        assert!(snap.logged_out.contains_key("ana"));
    }

    #[test]
    fn relogin_clears_logout_history() {
        let tracker = SessionTracker::new();
        tracker.login("ana");
        tracker.logout("ana");
        tracker.login("ana");
        let snap = tracker.snapshot();
        assert_eq!(snap.online, vec!["ana"]);
        assert!(!snap.logged_out.contains_key("ana"));
    }

    #[test]
    fn sweep_expires_idle_sessions() {
        let tracker = SessionTracker::new();
        tracker.login("ana");
        tracker.login("bruno");

        // Age ana's session past the timeout by hand.
        {
            let mut inner = tracker.inner.write().unwrap();
            let session = inner.active.get_mut("ana").unwrap();
            session.last_activity = Utc::now() - chrono::Duration::seconds(600);
        }

        assert_eq!(tracker.sweep(), 1);
        assert!(!tracker.is_online("ana"));
        assert!(tracker.is_online("bruno"));
        let snap = tracker.snapshot();
        assert!(snap.logged_out.contains_key("ana"));
    }

    #[test]
    fn rename_moves_live_session() {
        let tracker = SessionTracker::new();
        tracker.login("ana");
        tracker.rename("ana", "ana maria");
        assert!(!tracker.is_online("ana"));
        assert!(tracker.is_online("ana maria"));
    }

    #[tokio::test]
    async fn gate_blocks_until_permit_dropped() {
        let gate = Arc::new(ImportGate::new());
        let permit = gate.begin();
        assert!(gate.is_busy());

        // A short wait with the gate closed fails.
        assert!(!gate.wait_idle(Duration::from_millis(30)).await);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(permit);
        assert!(waiter.await.unwrap());
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn gate_stays_closed_while_any_permit_lives() {
        let gate = Arc::new(ImportGate::new());
        let first = gate.begin();
        let second = gate.begin();

        drop(first);
        assert!(gate.is_busy());
        assert!(!gate.wait_idle(Duration::from_millis(30)).await);

        drop(second);
        assert!(!gate.is_busy());
        assert!(gate.wait_idle(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn open_gate_does_not_wait() {
        let gate = Arc::new(ImportGate::new());
        assert!(gate.wait_idle(Duration::from_millis(1)).await);
    }
}
