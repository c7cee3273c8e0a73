//! Session context and credential handling
//!
//! The signed-in user and their bearer token travel as an explicit
//! [`SessionContext`]. [`Credentials`] is the shared holder the transport and
//! stream read from; it also owns the reaction to an expired token (wipe the
//! stored credentials, send the user back to login).

use crate::error::{Error, Result};
use crate::models::UserId;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl SessionContext {
    pub fn new(user_id: UserId, access_token: impl Into<String>) -> Self {
        Self {
            user_id,
            access_token: access_token.into(),
            refresh_token: None,
        }
    }

    /// Builds a context from a JWT access token whose payload carries a
    /// `user_id` claim.
    pub fn from_access_token(token: &str) -> Result<Self> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| Error::Storage("access token is not a JWT".into()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| Error::Storage(format!("malformed token payload: {}", e)))?;
        let claims: serde_json::Value = serde_json::from_slice(&bytes)?;
        let user_id = match &claims["user_id"] {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| Error::Storage("token has no user_id claim".into()))?;

        Ok(Self::new(user_id, token))
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

// ============================================================================
// Login redirect
// ============================================================================

/// Navigation seam used when the server rejects the credential.
pub trait LoginRedirect: Send + Sync {
    fn is_at_login(&self) -> bool;
    fn redirect_to_login(&self);
}

// ============================================================================
// Persistent store
// ============================================================================

pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("session.db"))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save(&self, session: &SessionContext) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO credentials (key, value) VALUES ('user_id', ?1)",
            params![session.user_id.to_string()],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO credentials (key, value) VALUES ('token', ?1)",
            params![session.access_token],
        )?;
        match &session.refresh_token {
            Some(refresh) => tx.execute(
                "INSERT OR REPLACE INTO credentials (key, value) VALUES ('refresh', ?1)",
                params![refresh],
            )?,
            None => tx.execute("DELETE FROM credentials WHERE key = 'refresh'", [])?,
        };
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<SessionContext>> {
        let get = |key: &str| -> Option<String> {
            self.conn
                .lock()
                .query_row(
                    "SELECT value FROM credentials WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .ok()
        };

        let (Some(user_id), Some(token)) = (get("user_id"), get("token")) else {
            return Ok(None);
        };
        let user_id = user_id
            .parse()
            .map_err(|_| Error::Storage(format!("corrupt user id: {}", user_id)))?;

        Ok(Some(SessionContext {
            user_id,
            access_token: token,
            refresh_token: get("refresh"),
        }))
    }

    pub fn clear(&self) -> Result<()> {
        self.conn.lock().execute("DELETE FROM credentials", [])?;
        Ok(())
    }
}

// ============================================================================
// Shared credentials
// ============================================================================

pub struct Credentials {
    current: RwLock<Option<SessionContext>>,
    store: Option<Arc<CredentialStore>>,
    redirect: Option<Arc<dyn LoginRedirect>>,
}

impl Credentials {
    pub fn new(session: Option<SessionContext>) -> Self {
        Self {
            current: RwLock::new(session),
            store: None,
            redirect: None,
        }
    }

    pub fn with_store(mut self, store: Arc<CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_redirect(mut self, redirect: Arc<dyn LoginRedirect>) -> Self {
        self.redirect = Some(redirect);
        self
    }

    pub fn current(&self) -> Option<SessionContext> {
        self.current.read().clone()
    }

    pub fn require(&self) -> Result<SessionContext> {
        self.current().ok_or(Error::NotLoggedIn)
    }

    pub fn replace(&self, session: SessionContext) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(&session)?;
        }
        *self.current.write() = Some(session);
        Ok(())
    }

    /// Drops the credential everywhere and forces the login screen, unless
    /// the user is already there.
    pub fn invalidate(&self) {
        let had_session = self.current.write().take().is_some();
        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                tracing::error!("Failed to clear stored credentials: {}", e);
            }
        }
        if had_session {
            tracing::warn!("Credential rejected by server, session cleared");
        }

        if let Some(redirect) = &self.redirect {
            if !redirect.is_at_login() {
                redirect.redirect_to_login();
            }
        }
    }
}
