//! Shared application state (spec §4.L/§4.J), handed to every handler as an
//! `Arc`-wrapped `Clone` the way the teacher's `AppState` is
//! (`ferrex-server/src/infra/app_state.rs`).

use std::sync::Arc;

use codehub_core::activity::ActivityBuffer;
use codehub_core::runtime::WorkspaceRuntime;
use reqwest::Client;
use sqlx::PgPool;

use crate::auth::cache::TtlCache;
use crate::auth::lockout::LoginLockout;
use codehub_config::Config;
use codehub_core::ids::{UserId, WorkspaceId};

#[derive(Clone)]
pub struct AppState(Arc<Inner>);

pub struct Inner {
    pub config: Arc<Config>,
    pub db: PgPool,
    pub redis: redis::aio::ConnectionManager,
    pub runtime: Arc<dyn WorkspaceRuntime>,
    pub activity: Arc<ActivityBuffer>,
    pub http: Client,
    pub session_cache: TtlCache<String, UserId>,
    pub ownership_cache: TtlCache<(WorkspaceId, UserId), bool>,
    pub login_lockout: LoginLockout,
}

impl std::ops::Deref for AppState {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        db: PgPool,
        redis: redis::aio::ConnectionManager,
        runtime: Arc<dyn WorkspaceRuntime>,
    ) -> Self {
        let auth_cache_ttl = std::time::Duration::from_secs(3);
        Self(Arc::new(Inner {
            session_cache: TtlCache::new(auth_cache_ttl, 1000),
            ownership_cache: TtlCache::new(auth_cache_ttl, 1000),
            login_lockout: LoginLockout::new(
                config.auth.login_lockout_threshold,
                config.auth.login_lockout_window,
            ),
            http: Client::builder()
                .build()
                .expect("reqwest client with default TLS backend builds"),
            activity: Arc::new(ActivityBuffer::new()),
            config,
            db,
            redis,
            runtime,
        }))
    }
}
