//! Session credentials and single-flight token refresh.
//!
//! Credentials are the one piece of state mutated by multiple concurrent
//! callers: any in-flight request may observe an auth failure and need to
//! trigger (or await) a refresh. Exactly one refresh runs at a time;
//! callers that lose the race observe the rotated token instead of
//! starting their own refresh.

use std::future::Future;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use roomline_core::{ClientError, ErrorCategory};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Authenticated session state for one homeserver account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    /// Server name part of the user ID, for example `example.org`.
    pub home_server: String,
    /// Base URL of the homeserver, for example `https://matrix.example.org`.
    pub home_server_url: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in_ms: Option<u64>,
}

/// Rotated token set produced by a refresh call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    /// Replacement refresh token; the previous one stays valid when absent.
    pub refresh_token: Option<String>,
    pub expires_in_ms: Option<u64>,
}

/// Callbacks observed by the surrounding application.
///
/// Every method has a default no-op body; implementors override only
/// what they care about.
pub trait SessionListener: Send + Sync {
    /// Called after each successful token rotation, so the application
    /// can persist the new pair.
    fn token_refreshed(&self, _credentials: &Credentials) {}
}

/// Listener that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// Shared mutable session state with a single-flight refresh gate.
pub struct Session {
    credentials: RwLock<Credentials>,
    refresh_gate: Mutex<()>,
    listener: Box<dyn SessionListener>,
}

impl Session {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_listener(credentials, Box::new(NoopListener))
    }

    pub fn with_listener(credentials: Credentials, listener: Box<dyn SessionListener>) -> Self {
        Self {
            credentials: RwLock::new(credentials),
            refresh_gate: Mutex::new(()),
            listener,
        }
    }

    /// Current access token.
    pub fn access_token(&self) -> String {
        self.read().access_token.clone()
    }

    /// Snapshot of the current credentials.
    pub fn credentials(&self) -> Credentials {
        self.read().clone()
    }

    /// Ensure the session holds a token newer than `stale_access_token`,
    /// running `refresh` under the single-flight gate if necessary.
    ///
    /// Returns the access token to retry with. Callers that arrive while
    /// a refresh is pending wait on the gate and observe the rotated
    /// token without issuing a second refresh. A failed refresh leaves
    /// the credentials untouched and escalates as a session-fatal auth
    /// error.
    pub async fn refresh_with<F, Fut>(
        &self,
        stale_access_token: &str,
        refresh: F,
    ) -> Result<String, ClientError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TokenPair, ClientError>>,
    {
        let _gate = self.refresh_gate.lock().await;

        let current = self.access_token();
        if current != stale_access_token {
            debug!("access token already rotated by a concurrent refresh");
            return Ok(current);
        }

        let refresh_token = self.credentials().refresh_token.ok_or_else(|| {
            ClientError::new(
                ErrorCategory::Auth,
                "refresh_unavailable",
                "session holds no refresh token",
            )
        })?;

        let pair = refresh(refresh_token).await.map_err(|err| {
            ClientError::new(
                ErrorCategory::Auth,
                "refresh_failed",
                format!("token refresh failed: {}", err.message),
            )
        })?;

        Ok(self.rotate(pair))
    }

    /// Replace the token pair and notify the listener. Returns the new
    /// access token.
    fn rotate(&self, pair: TokenPair) -> String {
        let snapshot = {
            let mut credentials = self.write();
            credentials.access_token = pair.access_token;
            if pair.refresh_token.is_some() {
                credentials.refresh_token = pair.refresh_token;
            }
            credentials.expires_in_ms = pair.expires_in_ms;
            credentials.clone()
        };
        self.listener.token_refreshed(&snapshot);
        snapshot.access_token
    }

    fn read(&self) -> RwLockReadGuard<'_, Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Credentials> {
        self.credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
