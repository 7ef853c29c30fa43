//! File-backed API token store.
//!
//! Tokens live in a YAML document readable only by the server's user. Only
//! hashes are persisted; the plaintext is shown once at creation. Every
//! mutation rewrites the file atomically (temp file + rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::errors::AppError;
use crate::models::token::{ConnectionProfile, IssuedToken, Token, TokenMetadata};
use crate::vault::SecretCipher;

pub const TOKEN_PREFIX: &str = "pgmcp_";
pub const MIN_HASH_PREFIX: usize = 8;
const LIST_HASH_PREFIX: usize = 12;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: BTreeMap<String, Token>,
}

/// Cheap change detector for the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

struct StoreState {
    file: TokenFile,
    fingerprint: Option<Fingerprint>,
}

pub struct TokenStore {
    path: PathBuf,
    cipher: Arc<SecretCipher>,
    state: RwLock<StoreState>,
}

/// Hex SHA-256 of a plaintext token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!(
        "{}{}",
        TOKEN_PREFIX,
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

fn generate_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("tok_{}", &raw[..12])
}

impl TokenStore {
    /// Open (or start) the token file. Fails if an existing file is readable
    /// by anyone but the owner.
    pub fn open(path: impl Into<PathBuf>, cipher: Arc<SecretCipher>) -> Result<Self, AppError> {
        let path = path.into();
        let (file, fingerprint) = if path.exists() {
            check_permissions(&path)?;
            let file = read_file(&path)?;
            (file, fingerprint(&path))
        } else {
            tracing::info!(path = %path.display(), "token file not found, starting empty");
            (TokenFile::default(), None)
        };

        tracing::info!(
            path = %path.display(),
            tokens = file.tokens.len(),
            "token store loaded"
        );

        Ok(Self {
            path,
            cipher,
            state: RwLock::new(StoreState { file, fingerprint }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a token. The plaintext in the result is never stored.
    pub async fn create(
        &self,
        annotation: &str,
        expires_in: Option<Duration>,
        id: Option<String>,
    ) -> Result<IssuedToken, AppError> {
        let mut state = self.state.write().await;

        let id = match id {
            Some(id) if id.trim().is_empty() => {
                return Err(AppError::InvalidArguments("token id must not be empty".into()))
            }
            Some(id) => id,
            None => generate_id(),
        };
        if state.file.tokens.contains_key(&id) {
            return Err(AppError::DuplicateName(format!("token id '{}'", id)));
        }

        let mut plaintext = generate_token();
        let mut hash = hash_token(&plaintext);
        while state.file.tokens.values().any(|t| t.hash == hash) {
            plaintext = generate_token();
            hash = hash_token(&plaintext);
        }

        let now = Utc::now();
        let expires_at = match expires_in {
            Some(d) => Some(now.checked_add_signed(d).ok_or_else(|| {
                AppError::InvalidArguments("token expiry is out of range".into())
            })?),
            None => None,
        };
        let mut next = state.file.tokens.clone();
        next.insert(
            id.clone(),
            Token {
                hash,
                annotation: annotation.to_string(),
                created_at: now,
                expires_at,
                default_connection: None,
                connections: BTreeMap::new(),
            },
        );
        self.commit(&mut state, next)?;

        tracing::info!(token_id = %id, expires_at = ?expires_at, "token created");
        Ok(IssuedToken {
            id,
            token: plaintext,
            expires_at,
        })
    }

    /// Resolve a presented plaintext token to its identity (the token id).
    pub async fn validate(&self, presented: &str) -> Result<String, AppError> {
        let candidate = hash_token(presented);
        let state = self.state.read().await;

        // Compare against every entry so timing does not depend on position.
        let mut matched: Option<(&String, &Token)> = None;
        for (id, token) in &state.file.tokens {
            if bool::from(token.hash.as_bytes().ct_eq(candidate.as_bytes())) {
                matched = Some((id, token));
            }
        }

        match matched {
            Some((id, token)) if token.is_expired_at(Utc::now()) => {
                tracing::debug!(token_id = %id, "rejected expired token");
                Err(AppError::Unauthorized("token expired".into()))
            }
            Some((id, _)) => Ok(id.clone()),
            None => Err(AppError::Unauthorized("unknown token".into())),
        }
    }

    pub async fn list(&self) -> Vec<TokenMetadata> {
        let state = self.state.read().await;
        let now = Utc::now();
        state
            .file
            .tokens
            .iter()
            .map(|(id, t)| TokenMetadata {
                id: id.clone(),
                hash_prefix: t.hash.chars().take(LIST_HASH_PREFIX).collect(),
                annotation: t.annotation.clone(),
                created_at: t.created_at,
                expires_at: t.expires_at,
                expired: t.is_expired_at(now),
                default_connection: t.default_connection.clone(),
                connections: t.connections.keys().cloned().collect(),
            })
            .collect()
    }

    /// Remove by exact id, or by a unique hash prefix of at least
    /// `MIN_HASH_PREFIX` hex characters. Returns the removed token's id.
    pub async fn remove(&self, id_or_prefix: &str) -> Result<String, AppError> {
        let mut state = self.state.write().await;

        let target = if state.file.tokens.contains_key(id_or_prefix) {
            id_or_prefix.to_string()
        } else {
            resolve_prefix(&state.file.tokens, id_or_prefix)?
        };

        let mut next = state.file.tokens.clone();
        next.remove(&target);
        self.commit(&mut state, next)?;

        tracing::info!(token_id = %target, "token removed");
        Ok(target)
    }

    /// Drop every expired token from the file. Returns the removed ids.
    pub async fn remove_expired(&self) -> Result<Vec<String>, AppError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let expired: Vec<String> = state
            .file
            .tokens
            .iter()
            .filter(|(_, t)| t.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }

        let mut next = state.file.tokens.clone();
        for id in &expired {
            next.remove(id);
        }
        self.commit(&mut state, next)?;
        tracing::info!(count = expired.len(), "expired tokens removed");
        Ok(expired)
    }

    /// Of the given identities, those whose token is gone or expired.
    pub async fn invalid_identities(&self, ids: &[String]) -> Vec<String> {
        let state = self.state.read().await;
        let now = Utc::now();
        ids.iter()
            .filter(|id| match state.file.tokens.get(id.as_str()) {
                Some(t) => t.is_expired_at(now),
                None => true,
            })
            .cloned()
            .collect()
    }

    // ── Saved connections ─────────────────────────────────────

    /// Save a connection profile on a token. `profile.password` is plaintext
    /// here and is encrypted before it touches disk.
    pub async fn add_connection(
        &self,
        token_id: &str,
        alias: &str,
        mut profile: ConnectionProfile,
    ) -> Result<(), AppError> {
        if alias.trim().is_empty() {
            return Err(AppError::InvalidArguments("alias must not be empty".into()));
        }
        if let Some(pw) = profile.password.take() {
            profile.password = Some(self.cipher.encrypt(&pw)?);
        }

        let mut state = self.state.write().await;
        let mut next = state.file.tokens.clone();
        let token = next
            .get_mut(token_id)
            .ok_or_else(|| AppError::NotFound(format!("token '{}'", token_id)))?;
        if token.connections.contains_key(alias) {
            return Err(AppError::DuplicateName(format!("connection '{}'", alias)));
        }
        token.connections.insert(alias.to_string(), profile);
        self.commit(&mut state, next)?;

        tracing::info!(token_id = %token_id, alias = %alias, "connection saved");
        Ok(())
    }

    pub async fn remove_connection(&self, token_id: &str, alias: &str) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let mut next = state.file.tokens.clone();
        let token = next
            .get_mut(token_id)
            .ok_or_else(|| AppError::NotFound(format!("token '{}'", token_id)))?;
        if token.connections.remove(alias).is_none() {
            return Err(AppError::NotFound(format!("connection '{}'", alias)));
        }
        if token.default_connection.as_deref() == Some(alias) {
            token.default_connection = None;
        }
        self.commit(&mut state, next)?;
        tracing::info!(token_id = %token_id, alias = %alias, "connection removed");
        Ok(())
    }

    pub async fn set_default_connection(&self, token_id: &str, alias: &str) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let mut next = state.file.tokens.clone();
        let token = next
            .get_mut(token_id)
            .ok_or_else(|| AppError::NotFound(format!("token '{}'", token_id)))?;
        if !token.connections.contains_key(alias) {
            return Err(AppError::NotFound(format!("connection '{}'", alias)));
        }
        token.default_connection = Some(alias.to_string());
        self.commit(&mut state, next)
    }

    /// The decrypted profile backing a token's pool, if it has one.
    pub async fn connection_for(
        &self,
        token_id: &str,
    ) -> Result<Option<(String, ConnectionProfile)>, AppError> {
        let state = self.state.read().await;
        let token = state
            .file
            .tokens
            .get(token_id)
            .ok_or_else(|| AppError::ResourceGone(format!("token '{}' no longer exists", token_id)))?;

        match token.active_connection() {
            Some((alias, profile)) => {
                let mut profile = profile.clone();
                if let Some(sealed) = profile.password.take() {
                    profile.password = Some(self.cipher.decrypt(&sealed)?);
                }
                Ok(Some((alias.clone(), profile)))
            }
            None => Ok(None),
        }
    }

    /// Saved profiles for a token with passwords removed.
    pub async fn connections(
        &self,
        token_id: &str,
    ) -> Result<(Option<String>, Vec<(String, ConnectionProfile)>), AppError> {
        let state = self.state.read().await;
        let token = state
            .file
            .tokens
            .get(token_id)
            .ok_or_else(|| AppError::NotFound(format!("token '{}'", token_id)))?;
        let active = token.active_connection().map(|(alias, _)| alias.clone());
        let profiles = token
            .connections
            .iter()
            .map(|(alias, p)| (alias.clone(), p.redacted()))
            .collect();
        Ok((active, profiles))
    }

    // ── Reload ────────────────────────────────────────────────

    /// Re-read the file if another process changed it. Returns the ids that
    /// disappeared or now carry a different secret.
    pub async fn reload_if_changed(&self) -> Result<Vec<String>, AppError> {
        let current = fingerprint(&self.path);
        {
            let state = self.state.read().await;
            if current.is_none() || current == state.fingerprint {
                return Ok(Vec::new());
            }
        }

        check_permissions(&self.path)?;
        let file = read_file(&self.path)?;

        let mut state = self.state.write().await;
        let removed: Vec<String> = state
            .file
            .tokens
            .iter()
            .filter(|(id, old)| match file.tokens.get(*id) {
                Some(new) => new.hash != old.hash,
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect();
        state.file = file;
        state.fingerprint = current;

        tracing::info!(
            tokens = state.file.tokens.len(),
            removed = removed.len(),
            "token file reloaded"
        );
        Ok(removed)
    }

    // ── Persistence ───────────────────────────────────────────

    /// Write `next` to disk, then swap it in. On failure the in-memory state
    /// is left untouched.
    fn commit(
        &self,
        state: &mut StoreState,
        next: BTreeMap<String, Token>,
    ) -> Result<(), AppError> {
        let file = TokenFile { tokens: next };
        write_file(&self.path, &file)?;
        state.file = file;
        state.fingerprint = fingerprint(&self.path);
        Ok(())
    }
}

fn resolve_prefix(tokens: &BTreeMap<String, Token>, prefix: &str) -> Result<String, AppError> {
    let prefix = prefix.to_ascii_lowercase();
    if !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::NotFound(format!("token '{}'", prefix)));
    }
    if prefix.len() < MIN_HASH_PREFIX {
        return Err(AppError::InvalidArguments(format!(
            "hash prefix must be at least {} hex characters",
            MIN_HASH_PREFIX
        )));
    }

    let matches: Vec<&String> = tokens
        .iter()
        .filter(|(_, t)| t.hash.starts_with(&prefix))
        .map(|(id, _)| id)
        .collect();

    match matches.as_slice() {
        [] => Err(AppError::NotFound(format!("no token with hash prefix '{}'", prefix))),
        [only] => Ok((*only).clone()),
        many => Err(AppError::AmbiguousPrefix {
            prefix,
            matches: many.len(),
        }),
    }
}

fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = std::fs::metadata(path).ok()?;
    Some(Fingerprint {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

fn read_file(path: &Path) -> Result<TokenFile, AppError> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read token file {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(TokenFile::default());
    }
    let file = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse token file {}", path.display()))?;
    Ok(file)
}

fn write_file(path: &Path, file: &TokenFile) -> Result<(), AppError> {
    use std::io::Write;

    let yaml = serde_yaml::to_string(file).context("failed to serialize token file")?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            restrict(dir, 0o700)?;
        }
    }

    let tmp = path.with_extension("tmp");
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut out = options
        .open(&tmp)
        .with_context(|| format!("failed to open {}", tmp.display()))?;
    out.write_all(yaml.as_bytes())
        .and_then(|_| out.sync_all())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    drop(out);

    // The temp file may predate this process with looser bits.
    restrict(&tmp, 0o600)?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<(), AppError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<(), AppError> {
    Ok(())
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), AppError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions()
        .mode()
        & 0o777;
    if mode & 0o077 != 0 {
        return Err(AppError::InsecurePermissions {
            path: path.display().to_string(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), AppError> {
    Ok(())
}

/// Parse a human expiry such as `30d`, `12h`, `90m` or `never`.
pub fn parse_expiry(raw: &str) -> Result<Option<Duration>, AppError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "never" {
        return Ok(None);
    }
    let unit_len = raw.chars().last().map(char::len_utf8).unwrap_or(0);
    let (num, unit) = raw.split_at(raw.len() - unit_len);
    let n: i64 = num
        .parse()
        .map_err(|_| AppError::InvalidArguments(format!("invalid expiry '{}'", raw)))?;
    if n <= 0 {
        return Err(AppError::InvalidArguments(format!("invalid expiry '{}'", raw)));
    }
    let d = match unit {
        "d" => Duration::try_days(n),
        "h" => Duration::try_hours(n),
        "m" => Duration::try_minutes(n),
        "w" => Duration::try_weeks(n),
        _ => {
            return Err(AppError::InvalidArguments(format!(
                "invalid expiry unit in '{}' (use m, h, d or w)",
                raw
            )))
        }
    };
    d.map(Some)
        .ok_or_else(|| AppError::InvalidArguments(format!("expiry '{}' is out of range", raw)))
}

/// Expiry timestamp for display.
pub fn describe_expiry(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::token::SslMode;

    fn cipher() -> Arc<SecretCipher> {
        Arc::new(SecretCipher::new(&"ab".repeat(32)).unwrap())
    }

    fn store(dir: &tempfile::TempDir) -> TokenStore {
        TokenStore::open(dir.path().join("tokens.yaml"), cipher()).unwrap()
    }

    fn fake_token(hash: &str) -> Token {
        Token {
            hash: hash.to_string(),
            annotation: String::new(),
            created_at: Utc::now(),
            expires_at: None,
            default_connection: None,
            connections: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let issued = store.create("ci bot", None, None).await.unwrap();
        assert!(issued.token.starts_with(TOKEN_PREFIX));
        assert!(issued.id.starts_with("tok_"));

        let identity = store.validate(&issued.token).await.unwrap();
        assert_eq!(identity, issued.id);

        let err = store.validate("pgmcp_not-a-real-token").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_plaintext_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let issued = store.create("", None, None).await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains(&issued.token));
        assert!(raw.contains(&hash_token(&issued.token)));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let issued = store
            .create("short", Some(Duration::seconds(-1)), None)
            .await
            .unwrap();

        let err = store.validate(&issued.token).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(ref m) if m.contains("expired")));

        let listed = store.list().await;
        assert!(listed[0].expired);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create("", None, Some("alice".into())).await.unwrap();
        let err = store.create("", None, Some("alice".into())).await.unwrap_err();
        assert!(matches!(err, AppError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn test_remove_by_id_and_unique_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let a = store.create("a", None, None).await.unwrap();
        let b = store.create("b", None, None).await.unwrap();

        assert_eq!(store.remove(&a.id).await.unwrap(), a.id);
        assert!(store.validate(&a.token).await.is_err());

        let prefix = &hash_token(&b.token)[..10];
        assert_eq!(store.remove(prefix).await.unwrap(), b.id);
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_prefix_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        {
            let mut state = store.state.write().await;
            let mut next = BTreeMap::new();
            next.insert("one".to_string(), fake_token(&format!("deadbeef{}", "0".repeat(56))));
            next.insert("two".to_string(), fake_token(&format!("deadbeef{}", "1".repeat(56))));
            store.commit(&mut state, next).unwrap();
        }

        let err = store.remove("deadbeef").await.unwrap_err();
        assert!(matches!(err, AppError::AmbiguousPrefix { matches: 2, .. }));
        assert_eq!(store.list().await.len(), 2);

        assert_eq!(store.remove("deadbeef1").await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_short_prefix_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create("", None, None).await.unwrap();

        let err = store.remove("abc").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArguments(_)));
        let err = store.remove("not-an-id-or-hex").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create("", None, None).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_open_rejects_world_readable_file() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.yaml");
        std::fs::write(&path, "tokens: {}\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = TokenStore::open(&path, cipher()).err().unwrap();
        assert!(matches!(err, AppError::InsecurePermissions { mode: 0o644, .. }));
    }

    #[tokio::test]
    async fn test_reload_reports_removed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let server = store(&dir);
        let t = server.create("", None, Some("bob".into())).await.unwrap();
        server.create("", None, Some("carol".into())).await.unwrap();

        // An admin process edits the same file.
        let admin = store(&dir);
        admin.remove("bob").await.unwrap();

        let removed = server.reload_if_changed().await.unwrap();
        assert_eq!(removed, vec!["bob".to_string()]);
        assert!(server.validate(&t.token).await.is_err());
        assert!(server.reload_if_changed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_reports_reissued_ids() {
        let dir = tempfile::tempdir().unwrap();
        let server = store(&dir);
        let old = server.create("", None, Some("alice".into())).await.unwrap();
        server.create("", None, Some("carol".into())).await.unwrap();

        let admin = store(&dir);
        admin.remove("alice").await.unwrap();
        let new = admin.create("", None, Some("alice".into())).await.unwrap();

        let removed = server.reload_if_changed().await.unwrap();
        assert_eq!(removed, vec!["alice".to_string()]);
        assert!(server.validate(&old.token).await.is_err());
        assert_eq!(server.validate(&new.token).await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_connection_password_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create("", None, Some("dana".into())).await.unwrap();

        let profile = ConnectionProfile {
            host: "db.internal".into(),
            port: 6432,
            user: "dana".into(),
            password: Some("hunter2".into()),
            dbname: Some("sales".into()),
            sslmode: SslMode::Require,
            application_name: None,
            description: "sales replica".into(),
            created_at: Utc::now(),
        };
        store.add_connection("dana", "sales", profile).await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("hunter2"));

        let (alias, resolved) = store.connection_for("dana").await.unwrap().unwrap();
        assert_eq!(alias, "sales");
        assert_eq!(resolved.password.as_deref(), Some("hunter2"));
        assert_eq!(resolved.port, 6432);

        let (active, listed) = store.connections("dana").await.unwrap();
        assert_eq!(active.as_deref(), Some("sales"));
        assert!(listed[0].1.password.is_none());
    }

    #[tokio::test]
    async fn test_connection_for_removed_token_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let err = store.connection_for("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::ResourceGone(_)));
    }

    #[tokio::test]
    async fn test_invalid_identities() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create("", None, Some("live".into())).await.unwrap();
        store
            .create("", Some(Duration::seconds(-5)), Some("stale".into()))
            .await
            .unwrap();

        let ids = vec!["live".to_string(), "stale".to_string(), "gone".to_string()];
        let invalid = store.invalid_identities(&ids).await;
        assert_eq!(invalid, vec!["stale".to_string(), "gone".to_string()]);

        assert_eq!(store.remove_expired().await.unwrap(), vec!["stale".to_string()]);
    }

    #[test]
    fn test_parse_expiry() {
        assert_eq!(parse_expiry("never").unwrap(), None);
        assert_eq!(parse_expiry("30d").unwrap(), Some(Duration::days(30)));
        assert_eq!(parse_expiry("12h").unwrap(), Some(Duration::hours(12)));
        assert!(parse_expiry("0d").is_err());
        assert!(parse_expiry("5y").is_err());
    }

    #[test]
    fn test_parse_expiry_out_of_range() {
        for raw in ["99999999999999d", "9223372036854775807m", "99999999999999w"] {
            let err = parse_expiry(raw).unwrap_err();
            assert!(matches!(err, AppError::InvalidArguments(_)), "{}", raw);
        }
    }

    #[tokio::test]
    async fn test_create_rejects_unrepresentable_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let far = parse_expiry("99999999999d").unwrap();
        let err = store.create("far", far, None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArguments(_)));
        assert!(store.list().await.is_empty());
    }
}
