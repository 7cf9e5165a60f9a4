/// Authorization sessions and token storage behind an injected store
use crate::error::{OAuthError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// State held between the authorization redirect and the callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub state: String,
    pub code_verifier: String,
    pub created_at: u64,
    /// Phone number entered before the redirect, returned with the token
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl Session {
    /// Create a new session
    pub fn new(state: String, code_verifier: String) -> Self {
        Self {
            state,
            code_verifier,
            created_at: now_secs(),
            phone_number: None,
        }
    }

    /// Create a new session carrying the user's phone number
    pub fn with_phone_number(state: String, code_verifier: String, phone_number: String) -> Self {
        Self {
            phone_number: Some(phone_number),
            ..Self::new(state, code_verifier)
        }
    }

    /// Whether the session is older than `ttl_secs`
    pub fn is_expired(&self, ttl_secs: u64) -> bool {
        now_secs().saturating_sub(self.created_at) > ttl_secs
    }
}

/// Token data returned by the DigiLocker token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub expires_at: Option<u64>,
    pub scope: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl Token {
    /// Check if the token is expired
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => now_secs() >= expires_at,
            None => false,
        }
    }
}

/// Storage interface for sessions and tokens
///
/// The OAuth client never touches global state; whatever holds the verifier
/// between redirect and callback is passed in through this trait.
pub trait SessionStorage: Send + Sync {
    /// Save a session
    fn save_session(&self, state: &str, session: Session) -> Result<()>;

    /// Get a session by state
    fn get_session(&self, state: &str) -> Result<Option<Session>>;

    /// Remove a session and return it, so a verifier is used at most once
    fn take_session(&self, state: &str) -> Result<Option<Session>>;

    /// Delete a session
    fn delete_session(&self, state: &str) -> Result<()>;

    /// Drop sessions older than `ttl_secs`, returning how many were removed
    fn prune_expired(&self, ttl_secs: u64) -> Result<usize>;

    /// Save a token
    fn save_token(&self, key: &str, token: Token) -> Result<()>;

    /// Get a token by key
    fn get_token(&self, key: &str) -> Result<Option<Token>>;

    /// Delete a token
    fn delete_token(&self, key: &str) -> Result<()>;
}

/// In-memory storage implementation
///
/// Thread-safe in-memory storage for sessions and tokens, suitable for a
/// single server process and for tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    tokens: Arc<RwLock<HashMap<String, Token>>>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn save_session(&self, state: &str, session: Session) -> Result<()> {
        self.sessions.write().insert(state.to_string(), session);
        Ok(())
    }

    fn get_session(&self, state: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().get(state).cloned())
    }

    fn take_session(&self, state: &str) -> Result<Option<Session>> {
        Ok(self.sessions.write().remove(state))
    }

    fn prune_expired(&self, ttl_secs: u64) -> Result<usize> {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(ttl_secs));
        Ok(before - sessions.len())
    }

    fn delete_session(&self, state: &str) -> Result<()> {
        self.sessions.write().remove(state);
        Ok(())
    }

    fn save_token(&self, key: &str, token: Token) -> Result<()> {
        self.tokens.write().insert(key.to_string(), token);
        Ok(())
    }

    fn get_token(&self, key: &str) -> Result<Option<Token>> {
        Ok(self.tokens.read().get(key).cloned())
    }

    fn delete_token(&self, key: &str) -> Result<()> {
        self.tokens.write().remove(key);
        Ok(())
    }
}

/// File-based storage using XDG conventions
///
/// Sessions live in `sessions.json`. Tokens are grouped per domain, taken
/// from the `domain:` prefix of the token key, in `tokens_<domain>.json`.
/// A process-local lock serializes read-modify-write cycles.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: PathBuf,
    write_lock: Arc<RwLock<()>>,
}

impl FileStorage {
    /// Create a file storage under `$XDG_DATA_HOME/<app_name>`
    ///
    /// Falls back to the platform data directory when `XDG_DATA_HOME` is
    /// unset.
    pub fn new(app_name: &str) -> Result<Self> {
        let base_dir = match std::env::var("XDG_DATA_HOME") {
            Ok(xdg_data) => PathBuf::from(xdg_data),
            Err(_) => dirs::data_dir().ok_or_else(|| {
                OAuthError::StorageError("Could not determine data directory".to_string())
            })?,
        };

        Self::with_path(base_dir.join(app_name))
    }

    /// Create a file storage instance at a custom path
    pub fn with_path(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self {
            base_path: path,
            write_lock: Arc::new(RwLock::new(())),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn sessions_path(&self) -> PathBuf {
        self.base_path.join("sessions.json")
    }

    fn tokens_path(&self, key: &str) -> PathBuf {
        let domain = key.split_once(':').map(|(d, _)| d).unwrap_or("default");
        let safe_domain = domain.replace(['/', '\\', ':'], "_");
        self.base_path.join(format!("tokens_{}.json", safe_domain))
    }

    fn load<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<HashMap<String, T>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write to a sibling temp file, then rename over `path`
    ///
    /// Readers see either the old or the new contents. The file holds
    /// verifiers and tokens, so it is owner-only on Unix.
    fn store<T: Serialize>(path: &Path, entries: &HashMap<String, T>) -> Result<()> {
        let content = serde_json::to_string_pretty(entries)?;
        let tmp_path = path.with_extension("json.tmp");

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // mode() only applies when the temp file is newly created
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn update_sessions<R>(&self, f: impl FnOnce(&mut HashMap<String, Session>) -> R) -> Result<R> {
        let _guard = self.write_lock.write();
        let path = self.sessions_path();
        let mut sessions = Self::load(&path)?;
        let out = f(&mut sessions);
        Self::store(&path, &sessions)?;
        Ok(out)
    }

    fn update_tokens<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Token>) -> R,
    ) -> Result<R> {
        let _guard = self.write_lock.write();
        let path = self.tokens_path(key);
        let mut tokens = Self::load(&path)?;
        let out = f(&mut tokens);
        Self::store(&path, &tokens)?;
        Ok(out)
    }
}

impl SessionStorage for FileStorage {
    fn save_session(&self, state: &str, session: Session) -> Result<()> {
        self.update_sessions(|sessions| {
            sessions.insert(state.to_string(), session);
        })
    }

    fn get_session(&self, state: &str) -> Result<Option<Session>> {
        let _guard = self.write_lock.read();
        let mut sessions: HashMap<String, Session> = Self::load(&self.sessions_path())?;
        Ok(sessions.remove(state))
    }

    fn take_session(&self, state: &str) -> Result<Option<Session>> {
        self.update_sessions(|sessions| sessions.remove(state))
    }

    fn prune_expired(&self, ttl_secs: u64) -> Result<usize> {
        self.update_sessions(|sessions| {
            let before = sessions.len();
            sessions.retain(|_, session| !session.is_expired(ttl_secs));
            before - sessions.len()
        })
    }

    fn delete_session(&self, state: &str) -> Result<()> {
        self.update_sessions(|sessions| {
            sessions.remove(state);
        })
    }

    fn save_token(&self, key: &str, token: Token) -> Result<()> {
        self.update_tokens(key, |tokens| {
            tokens.insert(key.to_string(), token);
        })
    }

    fn get_token(&self, key: &str) -> Result<Option<Token>> {
        let _guard = self.write_lock.read();
        let mut tokens: HashMap<String, Token> = Self::load(&self.tokens_path(key))?;
        Ok(tokens.remove(key))
    }

    fn delete_token(&self, key: &str) -> Result<()> {
        self.update_tokens(key, |tokens| {
            tokens.remove(key);
        })
    }
}
