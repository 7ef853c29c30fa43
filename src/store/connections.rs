//! Per-identity PostgreSQL pool management.
//!
//! In global mode every caller shares one pool built from the server default
//! connection. In per-token mode each token identity gets its own pool built
//! from that token's saved connection profile (or the server default when it
//! has none). Acquisition is acquire-or-create: concurrent first requests for
//! the same identity converge on a single pool.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tokio::sync::OnceCell;

use crate::errors::AppError;
use crate::models::token::{ConnectionProfile, SslMode};

/// Map key used for the shared pool in global mode.
pub const GLOBAL_KEY: &str = "__global__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    Global,
    PerToken,
}

impl FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(ConnectionMode::Global),
            "per-token" | "per_token" | "pertoken" => Ok(ConnectionMode::PerToken),
            other => Err(format!(
                "unknown auth mode '{}' (expected 'global' or 'per-token')",
                other
            )),
        }
    }
}

/// Fixed pool sizing applied to every pool this manager builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy {
    pub max_open: u32,
    /// Upper bound on idle connections. A connection returned while this many
    /// are already idle is closed instead of kept.
    pub max_idle: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl PoolPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_open == 0 {
            return Err("pool max_open must be at least 1".into());
        }
        if self.max_idle > self.max_open {
            return Err(format!(
                "pool max_idle ({}) must not exceed max_open ({})",
                self.max_idle, self.max_open
            ));
        }
        Ok(())
    }
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: 4,
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Where a pool's connections go.
#[derive(Debug, Clone)]
pub enum ConnectionTarget {
    ServerDefault,
    Saved {
        alias: String,
        profile: ConnectionProfile,
    },
}

/// Non-secret description of a pool's target.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TargetInfo {
    pub alias: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
}

/// The pool as seen from its own release hook. Emptied on teardown so the
/// hook does not keep the pool alive.
type IdleGate = Arc<Mutex<Option<PgPool>>>;

/// Whether a connection coming back to a pool with `idle` idle connections
/// may stay open.
pub(crate) fn keep_on_release(idle: usize, max_idle: u32) -> bool {
    idle < max_idle as usize
}

#[derive(Debug)]
pub struct PoolEntry {
    key: String,
    pool: PgPool,
    idle_gate: IdleGate,
    target: TargetInfo,
    policy: PoolPolicy,
    created_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
}

impl PoolEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    pub fn policy(&self) -> PoolPolicy {
        self.policy
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn close_gate(&self) {
        if let Ok(mut gate) = self.idle_gate.lock() {
            gate.take();
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

impl Drop for PoolEntry {
    fn drop(&mut self) {
        self.close_gate();
    }
}

/// Shared handle to an identity's pool.
pub type ResourceHandle = Arc<PoolEntry>;

type Slot = Arc<OnceCell<ResourceHandle>>;

const ACQUIRE_ATTEMPTS: usize = 3;

pub struct ConnectionManager {
    mode: ConnectionMode,
    policy: PoolPolicy,
    default_options: PgConnectOptions,
    slots: DashMap<String, Slot>,
    retired: DashMap<String, DateTime<Utc>>,
    created: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        mode: ConnectionMode,
        policy: PoolPolicy,
        database_url: &str,
    ) -> Result<Self, AppError> {
        policy.validate().map_err(AppError::InvalidArguments)?;
        let default_options: PgConnectOptions = database_url.parse()?;
        Ok(Self {
            mode,
            policy,
            default_options,
            slots: DashMap::new(),
            retired: DashMap::new(),
            created: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    fn key_for(&self, identity: &str) -> String {
        match self.mode {
            ConnectionMode::Global => GLOBAL_KEY.to_string(),
            ConnectionMode::PerToken => identity.to_string(),
        }
    }

    /// Return the pool for `identity`, creating it on first use.
    ///
    /// `resolve` is only consulted in per-token mode, and only by the single
    /// caller that ends up creating the pool.
    pub async fn acquire<F, Fut>(&self, identity: &str, resolve: F) -> Result<ResourceHandle, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConnectionTarget, AppError>>,
    {
        let key = self.key_for(identity);
        let mut resolve = Some(resolve);

        for _ in 0..ACQUIRE_ATTEMPTS {
            self.ensure_open(&key)?;

            let slot: Slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let handle = slot
                .get_or_try_init(|| {
                    let resolve = resolve.take();
                    let key = &key;
                    async move {
                        let target = match (self.mode, resolve) {
                            (ConnectionMode::PerToken, Some(resolve)) => resolve().await?,
                            (ConnectionMode::PerToken, None) => {
                                return Err(AppError::ResourceGone(format!(
                                    "pool for '{}' was torn down during acquisition",
                                    key
                                )))
                            }
                            (ConnectionMode::Global, _) => ConnectionTarget::ServerDefault,
                        };
                        Ok::<_, AppError>(self.build(key, target))
                    }
                })
                .await?
                .clone();

            // A release or retire may have raced with us; only hand out a
            // handle whose slot is still the live one.
            let still_live = self
                .slots
                .get(&key)
                .map(|current| Arc::ptr_eq(current.value(), &slot))
                .unwrap_or(false);
            if let Err(e) = self.ensure_open(&key) {
                // Retired after our first check but before the slot existed.
                if still_live {
                    self.teardown(&key).await;
                }
                return Err(e);
            }
            if still_live && !handle.pool.is_closed() {
                handle.touch();
                return Ok(handle);
            }
        }

        self.ensure_open(&key)?;
        Err(AppError::ResourceGone(format!(
            "pool for '{}' was torn down during acquisition",
            identity
        )))
    }

    fn ensure_open(&self, key: &str) -> Result<(), AppError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::ResourceGone("server is shutting down".into()));
        }
        if self.retired.contains_key(key) {
            return Err(AppError::ResourceGone(format!(
                "connection for '{}' has been revoked",
                key
            )));
        }
        Ok(())
    }

    fn build(&self, key: &str, target: ConnectionTarget) -> ResourceHandle {
        let (options, info) = match &target {
            ConnectionTarget::ServerDefault => (
                self.default_options.clone(),
                TargetInfo {
                    alias: None,
                    host: None,
                    port: None,
                    database: None,
                    user: None,
                },
            ),
            ConnectionTarget::Saved { alias, profile } => (
                profile_options(profile),
                TargetInfo {
                    alias: Some(alias.clone()),
                    host: Some(profile.host.clone()),
                    port: Some(profile.port),
                    database: Some(profile.database().to_string()),
                    user: Some(profile.user.clone()),
                },
            ),
        };

        let idle_gate: IdleGate = Arc::new(Mutex::new(None));
        let gate = idle_gate.clone();
        let max_idle = self.policy.max_idle;
        let pool = PgPoolOptions::new()
            .max_connections(self.policy.max_open)
            .min_connections(0)
            .idle_timeout(self.policy.idle_timeout)
            .max_lifetime(self.policy.max_lifetime)
            .acquire_timeout(Duration::from_secs(30))
            .after_release(move |_conn, _meta| {
                let idle = gate
                    .lock()
                    .ok()
                    .and_then(|pool| pool.as_ref().map(|p| p.num_idle()))
                    .unwrap_or(0);
                let keep = keep_on_release(idle, max_idle);
                Box::pin(async move { Ok::<_, sqlx::Error>(keep) })
            })
            .connect_lazy_with(options);
        if let Ok(mut slot) = idle_gate.lock() {
            *slot = Some(pool.clone());
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            key = %key,
            alias = ?info.alias,
            max_open = self.policy.max_open,
            "connection pool created"
        );

        Arc::new(PoolEntry {
            key: key.to_string(),
            pool,
            idle_gate,
            target: info,
            policy: self.policy,
            created_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
        })
    }

    /// Idle teardown. The identity can acquire again later and gets a fresh
    /// pool. Returns whether a pool existed. No-op for the shared global pool.
    pub async fn release(&self, identity: &str) -> bool {
        if self.mode == ConnectionMode::Global {
            return false;
        }
        self.teardown(identity).await
    }

    /// Permanent teardown for a removed identity: in-flight work finishes,
    /// later acquisitions fail with `ResourceGone` until `reinstate`.
    pub async fn retire(&self, identity: &str) -> bool {
        if self.mode == ConnectionMode::Global {
            return false;
        }
        self.retired.insert(identity.to_string(), Utc::now());
        self.teardown(identity).await
    }

    /// Lift a retirement, e.g. after a token with the same id was re-issued.
    pub fn reinstate(&self, identity: &str) {
        if self.retired.remove(identity).is_some() {
            tracing::info!(identity = %identity, "connection reinstated");
        }
    }

    async fn teardown(&self, key: &str) -> bool {
        let Some((_, slot)) = self.slots.remove(key) else {
            return false;
        };
        if let Some(handle) = slot.get() {
            // close() waits for checked-out connections to come back.
            handle.pool.close().await;
            handle.close_gate();
            tracing::info!(key = %key, "connection pool closed");
        }
        true
    }

    /// Release per-token pools unused for longer than `max_idle`.
    pub async fn release_idle(&self, max_idle: Duration) -> Vec<String> {
        if self.mode == ConnectionMode::Global {
            return Vec::new();
        }
        let stale: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| {
                slot.value()
                    .get()
                    .map(|h| h.idle_for() >= max_idle)
                    .unwrap_or(false)
            })
            .map(|slot| slot.key().clone())
            .collect();

        for key in &stale {
            self.teardown(key).await;
        }
        stale
    }

    /// Close every pool and refuse further acquisitions.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let keys: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        let closing = keys.iter().map(|k| self.teardown(k));
        let closed = futures::future::join_all(closing).await;
        tracing::info!(
            pools = closed.into_iter().filter(|c| *c).count(),
            "connection manager shut down"
        );
    }

    /// Pools built since startup.
    pub fn pools_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn live_pools(&self) -> usize {
        self.slots.iter().filter(|s| s.value().initialized()).count()
    }
}

fn profile_options(profile: &ConnectionProfile) -> PgConnectOptions {
    let ssl = match profile.sslmode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    };
    let mut options = PgConnectOptions::new()
        .host(&profile.host)
        .port(profile.port)
        .username(&profile.user)
        .database(profile.database())
        .ssl_mode(ssl)
        .application_name(profile.application_name.as_deref().unwrap_or("pgmcp"));
    if let Some(password) = &profile.password {
        options = options.password(password);
    }
    options
}

// ── Tests ──────────────────────────────────────────────────────
