//! Admin-panel authentication: a single-user bcrypt credential file plus an
//! in-memory session manager.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin123";
pub const STORAGE_FILE_NAME: &str = "admin_panel_auth.json";
pub const SESSION_COOKIE_NAME: &str = "b2a_admin_session";
pub const MIN_PASSWORD_LENGTH: usize = 6;
const SESSION_TTL_HOURS: i64 = 12;
const BCRYPT_COST: u32 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialRecord {
    version: u32,
    username: String,
    password_hash: String,
    updated_at: DateTime<Utc>,
}

/// Credential store persisted as `admin_panel_auth.json` in the data dir.
/// Initialized with the default admin credentials on first run; a corrupt
/// file is set aside and re-initialized.
pub struct CredentialStore {
    path: PathBuf,
    record: RwLock<CredentialRecord>,
}

impl CredentialStore {
    pub fn new(data_dir: &Path) -> Result<Self, String> {
        std::fs::create_dir_all(data_dir).map_err(|e| format!("create data dir: {}", e))?;
        let path = data_dir.join(STORAGE_FILE_NAME);
        let record = Self::load_or_init(&path)?;
        Ok(Self { path, record: RwLock::new(record) })
    }

    fn load_or_init(path: &Path) -> Result<CredentialRecord, String> {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<CredentialRecord>(&raw) {
                Ok(rec) if !rec.username.trim().is_empty() && !rec.password_hash.is_empty() => {
                    Ok(rec)
                }
                _ => {
                    let backup =
                        format!("{}.broken.{}", path.display(), Utc::now().format("%Y%m%d%H%M%S"));
                    let _ = std::fs::rename(path, &backup);
                    tracing::warn!("Corrupt admin credential file moved to {}", backup);
                    Self::init_default(path)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::init_default(path),
            Err(e) => Err(format!("read admin credentials: {}", e)),
        }
    }

    fn init_default(path: &Path) -> Result<CredentialRecord, String> {
        let hash = bcrypt::hash(DEFAULT_PASSWORD, BCRYPT_COST)
            .map_err(|e| format!("hash default password: {}", e))?;
        let record = CredentialRecord {
            version: 1,
            username: DEFAULT_USERNAME.to_string(),
            password_hash: hash,
            updated_at: Utc::now(),
        };
        Self::persist(path, &record)?;
        tracing::info!("Initialized admin panel credentials ({})", DEFAULT_USERNAME);
        Ok(record)
    }

    fn persist(path: &Path, record: &CredentialRecord) -> Result<(), String> {
        let raw = serde_json::to_string_pretty(record).map_err(|e| e.to_string())?;
        std::fs::write(path, raw).map_err(|e| format!("write admin credentials: {}", e))
    }

    pub fn username(&self) -> String {
        self.record.read().username.clone()
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        let record = self.record.read().clone();
        if username.trim() != record.username {
            return false;
        }
        bcrypt::verify(password, &record.password_hash).unwrap_or(false)
    }

    pub fn change_password(&self, new_password: &str) -> Result<DateTime<Utc>, String> {
        let new_password = new_password.trim();
        if new_password.len() < MIN_PASSWORD_LENGTH {
            return Err(format!("password must be at least {} characters", MIN_PASSWORD_LENGTH));
        }
        let hash =
            bcrypt::hash(new_password, BCRYPT_COST).map_err(|e| format!("hash password: {}", e))?;
        let now = Utc::now();
        let record = {
            let mut record = self.record.write();
            record.password_hash = hash;
            record.updated_at = now;
            record.clone()
        };
        Self::persist(&self.path, &record)?;
        Ok(now)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub token: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

/// In-memory signed-cookie sessions, 12 h TTL.
pub struct SessionManager {
    ttl: Duration,
    sessions: DashMap<String, SessionInfo>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self { ttl: Duration::hours(SESSION_TTL_HOURS), sessions: DashMap::new() }
    }

    pub fn create(&self, username: &str) -> SessionInfo {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        let info = SessionInfo {
            token: token.clone(),
            username: username.to_string(),
            expires_at: Utc::now() + self.ttl,
        };
        self.sessions.insert(token, info.clone());
        info
    }

    pub fn validate(&self, token: &str) -> Option<SessionInfo> {
        let info = self.sessions.get(token)?.clone();
        if Utc::now() > info.expires_at {
            self.sessions.remove(token);
            return None;
        }
        Some(info)
    }

    pub fn delete(&self, token: &str) {
        self.sessions.remove(token);
    }

    pub fn delete_by_username(&self, username: &str) {
        self.sessions.retain(|_, info| info.username != username);
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_initializes_and_verifies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path()).unwrap();
        assert_eq!(store.username(), DEFAULT_USERNAME);
        assert!(store.verify(DEFAULT_USERNAME, DEFAULT_PASSWORD));
        assert!(!store.verify(DEFAULT_USERNAME, "wrong"));
        assert!(!store.verify("someone", DEFAULT_PASSWORD));
    }

    #[test]
    fn change_password_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path()).unwrap();
        store.change_password("next-secret").unwrap();
        assert!(store.verify(DEFAULT_USERNAME, "next-secret"));

        let reopened = CredentialStore::new(dir.path()).unwrap();
        assert!(reopened.verify(DEFAULT_USERNAME, "next-secret"));
        assert!(!reopened.verify(DEFAULT_USERNAME, DEFAULT_PASSWORD));
    }

    #[test]
    fn short_passwords_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path()).unwrap();
        assert!(store.change_password("abc").is_err());
    }

    #[test]
    fn corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STORAGE_FILE_NAME), "not json").unwrap();
        let store = CredentialStore::new(dir.path()).unwrap();
        assert!(store.verify(DEFAULT_USERNAME, DEFAULT_PASSWORD));
    }

    #[test]
    fn sessions_validate_and_revoke() {
        let manager = SessionManager::new();
        let session = manager.create("admin");
        assert!(manager.validate(&session.token).is_some());
        manager.delete(&session.token);
        assert!(manager.validate(&session.token).is_none());

        let s1 = manager.create("admin");
        let s2 = manager.create("admin");
        manager.delete_by_username("admin");
        assert!(manager.validate(&s1.token).is_none());
        assert!(manager.validate(&s2.token).is_none());
    }
}
