use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::storage::SnapshotStorage;
use crate::util::now_millis;
use crate::{normalize_permissions, Result, Session, SessionSnapshot, SessionType, Unsubscribe};

pub type ChangeListener = Box<dyn Fn(&SessionSnapshot) + Send + Sync>;

type ListenerSlot = Arc<Mutex<Vec<(u64, Arc<ChangeListener>)>>>;

struct ManagerState {
    sessions: Vec<Session>,
    active_session_id: Option<String>,
    hydrated: bool,
    last_stamp: u64,
}

impl ManagerState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            sessions: self.sessions.clone(),
            active_session_id: self.active_session_id.clone(),
        }
    }

    /// Monotonic millisecond stamp; strictly increases even within one ms.
    fn next_stamp(&mut self) -> u64 {
        let stamp = now_millis().max(self.last_stamp + 1);
        self.last_stamp = stamp;
        stamp
    }
}

/// Single source of truth for sessions and the active-session pointer.
///
/// Every mutation runs as one update + persist + emit sequence under the
/// state lock, so listeners always observe monotonic snapshots. Listeners
/// receive the full snapshot and must not call back into the manager
/// synchronously.
pub struct SessionManager {
    state: Mutex<ManagerState>,
    storage: Arc<dyn SnapshotStorage>,
    listeners: ListenerSlot,
    next_listener_id: AtomicU64,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                sessions: Vec::new(),
                active_session_id: None,
                hydrated: false,
                last_stamp: 0,
            }),
            storage,
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(0),
        }
    }

    /// Load the persisted snapshot once, applying legacy migrations.
    /// Subsequent calls are no-ops.
    pub fn hydrate(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.hydrated {
            return Ok(());
        }
        state.hydrated = true;

        let Some(snapshot) = self.storage.load() else {
            return Ok(());
        };

        let signer_initiated_prefix = format!("{}:", SessionType::SignerInitiated.as_str());
        let mut sessions = snapshot.sessions;
        let mut migrated = false;
        for session in &mut sessions {
            if session.id.starts_with(&signer_initiated_prefix)
                && session.user_pubkey.is_none()
                && !session.remote_signer_pubkey.is_empty()
            {
                session.user_pubkey = Some(session.remote_signer_pubkey.clone());
                migrated = true;
            }
        }

        state.active_session_id = snapshot
            .active_session_id
            .filter(|id| sessions.iter().any(|s| &s.id == id));
        state.sessions = sessions;

        if migrated {
            let snapshot = state.snapshot();
            let saved = self.storage.save(&snapshot);
            self.emit(&snapshot);
            drop(state);
            saved?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().unwrap().snapshot()
    }

    pub fn get_sessions(&self) -> Vec<Session> {
        self.state.lock().unwrap().sessions.clone()
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn get_session_by_client_pubkey(&self, pubkey: &str) -> Option<Session> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.client_public_key == pubkey)
            .cloned()
    }

    pub fn get_active_session(&self) -> Option<Session> {
        let state = self.state.lock().unwrap();
        let id = state.active_session_id.as_ref()?;
        state.sessions.iter().find(|s| &s.id == id).cloned()
    }

    /// Insert or replace a session. `created_at` of an existing id is
    /// preserved; the first session ever stored becomes active.
    pub fn upsert_session(&self, mut session: Session) -> Result<Session> {
        self.mutate(move |state| {
            session.permissions = normalize_permissions(&session.permissions);
            session.updated_at = state.next_stamp();

            if let Some(existing) = state.sessions.iter_mut().find(|s| s.id == session.id) {
                session.created_at = existing.created_at;
                *existing = session.clone();
            } else {
                state.sessions.push(session.clone());
                if state.active_session_id.is_none() {
                    state.active_session_id = Some(session.id.clone());
                }
            }
            session
        })
    }

    /// Patch a session in place. Returns `Ok(None)` without persisting when
    /// the id is unknown.
    pub fn update_session<F>(&self, id: &str, patch: F) -> Result<Option<Session>>
    where
        F: FnOnce(&mut Session),
    {
        self.try_mutate(move |state| {
            let stamp = state.next_stamp();
            let session = state.sessions.iter_mut().find(|s| s.id == id)?;
            patch(session);
            session.updated_at = stamp;
            Some(session.clone())
        })
    }

    /// Remove a session. Removing the active one promotes the first
    /// remaining session, or clears the pointer when none remain.
    pub fn remove_session(&self, id: &str) -> Result<()> {
        self.mutate(|state| {
            state.sessions.retain(|s| s.id != id);
            if state.active_session_id.as_deref() == Some(id) {
                state.active_session_id = state.sessions.first().map(|s| s.id.clone());
            }
        })
    }

    pub fn set_active_session(&self, id: &str) -> Result<()> {
        self.try_mutate(|state| {
            if !state.sessions.iter().any(|s| s.id == id) {
                return None;
            }
            state.active_session_id = Some(id.to_string());
            Some(())
        })?
        .ok_or_else(|| crate::Error::SessionNotFound(id.to_string()))
    }

    /// Register a change listener. The current snapshot is delivered
    /// synchronously before this returns; afterwards the listener fires
    /// after every persisted mutation.
    pub fn on_change(&self, listener: ChangeListener) -> Unsubscribe {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(listener);
        self.listeners.lock().unwrap().push((id, listener.clone()));

        let snapshot = self.snapshot();
        Self::notify(&listener, &snapshot);

        let slot = self.listeners.clone();
        Box::new(move || {
            slot.lock().unwrap().retain(|(lid, _)| *lid != id);
        })
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut ManagerState) -> R) -> Result<R> {
        self.try_mutate(|state| Some(f(state)))
            .map(|out| out.expect("infallible mutation"))
    }

    /// Runs `f` under the state lock; when it returns `Some`, persists and
    /// emits before releasing. Listeners see the post-mutation snapshot
    /// regardless of the persistence outcome.
    fn try_mutate<R>(&self, f: impl FnOnce(&mut ManagerState) -> Option<R>) -> Result<Option<R>> {
        let mut state = self.state.lock().unwrap();
        let Some(out) = f(&mut state) else {
            return Ok(None);
        };
        let snapshot = state.snapshot();
        let saved = self.storage.save(&snapshot);
        self.emit(&snapshot);
        drop(state);
        saved.map(|_| Some(out))
    }

    fn emit(&self, snapshot: &SessionSnapshot) {
        let listeners: Vec<Arc<ChangeListener>> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            Self::notify(&listener, snapshot);
        }
    }

    fn notify(listener: &Arc<ChangeListener>, snapshot: &SessionSnapshot) {
        if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
            tracing::warn!("session change listener panicked");
        }
    }
}
