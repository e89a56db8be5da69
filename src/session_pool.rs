//! Reusable discovery sessions
//!
//! By default every discovery task opens and closes its own session. With
//! `discovery.reuse_sessions` enabled, finished sessions are checked back in
//! here and handed to later tasks after a health check and a reset to a blank
//! page. A session whose task failed is never checked in.

use crate::{DomSession, HarvestError, SessionConfig, SessionFactory, SessionGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const BLANK_PAGE: &str = "about:blank";

struct IdleSession {
    session: Box<dyn DomSession>,
    idle_since: Instant,
}

pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    config: SessionConfig,
    idle: Mutex<VecDeque<IdleSession>>,
    max_idle: usize,
    is_shutting_down: AtomicBool,
    opened: AtomicUsize,
    reused: AtomicUsize,
    discarded: AtomicUsize,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, config: SessionConfig, max_idle: usize) -> Self {
        Self {
            factory,
            config,
            idle: Mutex::new(VecDeque::new()),
            max_idle,
            is_shutting_down: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    /// Hand out an idle session that passes its health check, or open a new one.
    pub async fn checkout(&self) -> Result<Box<dyn DomSession>, HarvestError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(HarvestError::TaskFailed("session pool is shut down".to_string()));
        }

        loop {
            let candidate = self.idle.lock().await.pop_front();
            let Some(candidate) = candidate else { break };

            if self.reset(candidate.session.as_ref()).await {
                debug!(
                    "Reusing session idle for {:?}",
                    candidate.idle_since.elapsed()
                );
                self.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(candidate.session);
            }

            warn!("Discarding unhealthy pooled session");
            self.discard(candidate.session).await;
        }

        let session = self.factory.open(&self.config).await?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    /// Return a session after its task finished. Failed or surplus sessions
    /// are closed.
    pub async fn checkin(&self, session: Box<dyn DomSession>, task_succeeded: bool) {
        if !task_succeeded || self.is_shutting_down.load(Ordering::Relaxed) {
            self.discard(session).await;
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.max_idle {
            drop(idle);
            self.discard(session).await;
            return;
        }
        idle.push_back(IdleSession {
            session,
            idle_since: Instant::now(),
        });
    }

    async fn reset(&self, session: &dyn DomSession) -> bool {
        session.is_healthy().await && session.navigate(BLANK_PAGE).await.is_ok()
    }

    async fn discard(&self, session: Box<dyn DomSession>) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = session.close().await {
            warn!("Failed to close pooled session: {}", e);
        }
    }

    pub async fn get_stats(&self) -> SessionPoolStats {
        let idle = self.idle.lock().await;
        SessionPoolStats {
            opened: self.opened.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            idle: idle.len(),
            longest_idle: idle.iter().map(|s| s.idle_since.elapsed()).max(),
        }
    }

    /// Close every idle session and refuse further checkouts.
    pub async fn shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::Relaxed);
        let drained: Vec<IdleSession> = self.idle.lock().await.drain(..).collect();
        let count = drained.len();
        for idle in drained {
            if let Err(e) = idle.session.close().await {
                warn!("Failed to close pooled session: {}", e);
            }
        }
        info!("Session pool shut down, closed {} idle sessions", count);
    }
}

#[derive(Debug, Clone)]
pub struct SessionPoolStats {
    pub opened: usize,
    pub reused: usize,
    pub discarded: usize,
    pub idle: usize,
    pub longest_idle: Option<Duration>,
}

/// Where discovery tasks get their sessions from
#[derive(Clone)]
pub enum SessionSource {
    /// A fresh session per task, closed when the task ends.
    Fresh {
        factory: Arc<dyn SessionFactory>,
        config: SessionConfig,
    },
    Pooled(Arc<SessionPool>),
}

impl SessionSource {
    pub async fn acquire(&self) -> Result<Box<dyn DomSession>, HarvestError> {
        match self {
            SessionSource::Fresh { factory, config } => factory.open(config).await,
            SessionSource::Pooled(pool) => pool.checkout().await,
        }
    }

    pub async fn release(&self, guard: SessionGuard, task_succeeded: bool) {
        match self {
            SessionSource::Fresh { .. } => guard.release().await,
            SessionSource::Pooled(pool) => pool.checkin(guard.into_inner(), task_succeeded).await,
        }
    }

    pub async fn shutdown(&self) {
        if let SessionSource::Pooled(pool) = self {
            pool.shutdown().await;
        }
    }
}
