//! Background job: expire sessions and tear down pools nobody can reach.
//!
//! Each pass:
//! 1. evicts expired sessions and releases the pools of identities left
//!    without a live session,
//! 2. reloads the token file if it changed on disk and retires removed ids,
//! 3. retires identities whose token has expired,
//! 4. releases per-token pools idle for longer than the pool policy allows.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::mcp::RequestDispatcher;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub released: Vec<String>,
    pub retired: Vec<String>,
    pub idle: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_sessions == 0
            && self.released.is_empty()
            && self.retired.is_empty()
            && self.idle.is_empty()
    }
}

/// Spawn the sweep loop. Call this once at startup.
pub fn spawn(
    dispatcher: Arc<RequestDispatcher>,
    every: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            // A panicking pass must not end the loop.
            let pass = dispatcher.clone();
            let report = match tokio::spawn(async move { sweep(&pass, idle_timeout).await }).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(error = %e, "cleanup sweep aborted");
                    continue;
                }
            };
            if !report.is_empty() {
                tracing::info!(
                    expired_sessions = report.expired_sessions,
                    released = report.released.len(),
                    retired = report.retired.len(),
                    idle = report.idle.len(),
                    "cleanup sweep"
                );
            }
        }
    })
}

pub async fn sweep(dispatcher: &RequestDispatcher, idle_timeout: Duration) -> SweepReport {
    let sessions = dispatcher.sessions();
    let connections = dispatcher.connections();
    let tokens = dispatcher.tokens();
    let mut report = SweepReport::default();

    let expired = sessions.sweep_expired();
    report.expired_sessions = expired.len();
    for identity in expired {
        if !sessions.has_live_session(&identity) && connections.release(&identity).await {
            report.released.push(identity);
        }
    }

    let removed = match tokens.reload_if_changed().await {
        Ok(removed) => removed,
        Err(e) => {
            tracing::error!(error = %e, "token file reload failed, keeping previous tokens");
            Vec::new()
        }
    };
    let invalid = tokens.invalid_identities(&sessions.identities()).await;
    for identity in removed.into_iter().chain(invalid) {
        if report.retired.contains(&identity) {
            continue;
        }
        let revoked = sessions.revoke_identity(&identity);
        connections.retire(&identity).await;
        tracing::info!(identity = %identity, sessions = revoked, "identity retired");
        report.retired.push(identity);
    }

    report.idle = connections.release_idle(idle_timeout).await;
    report
}
