use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;

use crate::backend::SharedBackend;
use crate::error::{MonitorError, Result};
use crate::notify::Notifier;
use crate::session::credential::{validate, Credential, CredentialForm};
use crate::session::store::{load_credential, save_credential, KeyValueStore};

/// Authentication lifecycle as seen by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initial,
    Probing,
    Unauthenticated,
    Authenticating,
    Authenticated,
    LoggingOut,
}

impl SessionState {
    /// The login form is shown but must not accept input.
    pub fn form_disabled(self) -> bool {
        matches!(self, SessionState::Authenticating | SessionState::LoggingOut)
    }

    pub fn is_authenticated(self) -> bool {
        self == SessionState::Authenticated
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initial => "initial",
            SessionState::Probing => "probing",
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::LoggingOut => "logging_out",
        };
        f.write_str(name)
    }
}

/// Owns the session state and the only code paths that change it.
pub struct SessionManager {
    backend: SharedBackend,
    notifier: Notifier,
    store: Arc<dyn KeyValueStore>,
    state_tx: watch::Sender<SessionState>,
    /// Set once the "already logged in" notice went out for the current
    /// session; cleared when the session ends
    restored_notice_shown: AtomicBool,
    saved: Mutex<Option<Credential>>,
}

impl SessionManager {
    /// Reads the persisted credential once to seed the login form.
    pub fn new(backend: SharedBackend, notifier: Notifier, store: Arc<dyn KeyValueStore>) -> Self {
        let saved = load_credential(store.as_ref());
        let (state_tx, _) = watch::channel(SessionState::Initial);
        Self {
            backend,
            notifier,
            store,
            state_tx,
            restored_notice_shown: AtomicBool::new(false),
            saved: Mutex::new(saved),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    /// Form contents to start from: the saved credential (MFA cleared) or empty.
    pub fn form_defaults(&self) -> CredentialForm {
        let saved = self.saved.lock().unwrap_or_else(|e| e.into_inner());
        saved
            .as_ref()
            .map(CredentialForm::from)
            .unwrap_or_default()
    }

    /// Atomically move from one of `from` to `to`. Returns the state seen.
    fn transition(&self, from: &[SessionState], to: SessionState) -> std::result::Result<(), SessionState> {
        let mut seen = SessionState::Initial;
        let moved = self.state_tx.send_if_modified(|state| {
            seen = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(from = %seen, to = %to, "Session transition");
            Ok(())
        } else {
            Err(seen)
        }
    }

    fn set(&self, to: SessionState) {
        tracing::debug!(to = %to, "Session transition");
        self.state_tx.send_replace(to);
    }

    /// Ask the backend whether a session already exists.
    ///
    /// Probe failures end in `Unauthenticated` after surfacing the error.
    pub async fn probe(&self) -> SessionState {
        let entry = [
            SessionState::Initial,
            SessionState::Unauthenticated,
            SessionState::Authenticated,
        ];
        if let Err(current) = self.transition(&entry, SessionState::Probing) {
            return current;
        }
        let next = match self.backend.is_logged_in().await {
            Ok(true) => {
                if !self.restored_notice_shown.swap(true, Ordering::SeqCst) {
                    self.notifier.info("Already logged in");
                }
                SessionState::Authenticated
            }
            Ok(false) => {
                self.restored_notice_shown.store(false, Ordering::SeqCst);
                SessionState::Unauthenticated
            }
            Err(e) => {
                self.restored_notice_shown.store(false, Ordering::SeqCst);
                self.notifier
                    .error(format!("Could not check login status: {e}"));
                SessionState::Unauthenticated
            }
        };
        self.set(next);
        next
    }

    /// Validate `form` and log in. With `save`, the credential is persisted
    /// (without its MFA code) before the remote call.
    pub async fn login(&self, form: &CredentialForm, save: bool) -> Result<()> {
        let current = self.state();
        if current.form_disabled() {
            return Err(MonitorError::Busy("login"));
        }
        if current.is_authenticated() {
            return Err(MonitorError::AlreadyAuthenticated);
        }

        let credential = validate(form).map_err(MonitorError::Validation)?;

        self.transition(
            &[SessionState::Initial, SessionState::Unauthenticated],
            SessionState::Authenticating,
        )
        .map_err(|seen| match seen {
            SessionState::Authenticated => MonitorError::AlreadyAuthenticated,
            _ => MonitorError::Busy("login"),
        })?;

        if save {
            match save_credential(self.store.as_ref(), &credential) {
                Ok(()) => {
                    *self.saved.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(credential.redacted());
                }
                Err(e) => tracing::warn!(error = %e, "Could not save login credential"),
            }
        }

        tracing::info!(
            host = %credential.host.0,
            port = credential.host.1,
            username = %credential.username,
            "Logging in"
        );
        match self.backend.login(&credential).await {
            Ok(_) => {
                self.restored_notice_shown.store(true, Ordering::SeqCst);
                self.set(SessionState::Authenticated);
                self.notifier.success("Logged in");
                Ok(())
            }
            Err(e) => {
                self.set(SessionState::Unauthenticated);
                self.notifier.error(format!("Login failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Log out. The session always ends `Unauthenticated`, even if the
    /// remote call fails; the failure is surfaced and returned.
    pub async fn logout(&self) -> Result<()> {
        match self.transition(&[SessionState::Authenticated], SessionState::LoggingOut) {
            Ok(()) => {}
            Err(current) if current.form_disabled() || current == SessionState::Probing => {
                return Err(MonitorError::Busy("logout"))
            }
            Err(_) => return Err(MonitorError::NotAuthenticated),
        }

        let result = self.backend.logout().await;
        self.restored_notice_shown.store(false, Ordering::SeqCst);
        self.set(SessionState::Unauthenticated);
        match result {
            Ok(_) => {
                self.notifier.success("Logged out");
                Ok(())
            }
            Err(e) => {
                self.notifier.error(format!("Logout failed: {e}"));
                Err(e.into())
            }
        }
    }
}
