//! `codehub-server` binary: the control plane process. `serve` (the
//! default subcommand) wires configuration, Postgres/Redis, the three
//! coordinator loops, the event listener, and the axum app together; `user`
//! offers the admin CLI the spec calls an operator's only way to manage
//! accounts outside the bootstrap (spec §6, §4.L).

mod activity_flush;
mod admin;
mod api;
mod auth;
mod coordinators;
mod errors;
mod proxy;
mod sse;
mod state;
mod workspace_service;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use redis::aio::ConnectionManager;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use codehub_config::Config;
use codehub_core::coordinator::{CoordinatorLoop, NotifyPublisher, NotifySubscriber};
use codehub_core::database::postgres::{self, PoolConfig};
use codehub_core::eventbus::EventListener;
use codehub_core::leader::PgAdvisoryLock;
use codehub_core::runtime::{FakeRuntime, WorkspaceRuntime};

use coordinators::{ObserverCoordinator, SchedulerCoordinator, WcCoordinator};
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "codehub-server")]
#[command(about = "CodeHub control plane: coordinators, API, and workspace proxy")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the control plane (coordinators + HTTP server). Default when no
    /// subcommand is given.
    Serve,
    /// Manages user accounts without going through the HTTP API.
    User {
        #[command(subcommand)]
        action: UserAction,
    },
}

#[derive(Subcommand, Debug)]
enum UserAction {
    Create { username: String, password: String },
    ResetPassword { username: String, password: String },
    List,
    Delete { username: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.rust_log.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db = postgres::connect(&config.database.database_url, PoolConfig::default()).await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, db).await,
        Command::User { action } => run_user_command(&db, action).await,
    }
}

async fn run_user_command(db: &sqlx::PgPool, action: UserAction) -> anyhow::Result<()> {
    match action {
        UserAction::Create { username, password } => admin::create_user(db, &username, &password).await,
        UserAction::ResetPassword { username, password } => {
            admin::reset_password(db, &username, &password).await
        }
        UserAction::List => admin::list_users(db).await,
        UserAction::Delete { username } => admin::delete_user(db, &username).await,
    }
}

async fn serve(config: Arc<Config>, db: sqlx::PgPool) -> anyhow::Result<()> {
    admin::bootstrap(&db, &config.auth.admin_username, &config.auth.admin_password).await?;

    let redis_client = redis::Client::open(config.redis.redis_url.clone())?;
    let redis: ConnectionManager = redis_client.get_connection_manager().await?;

    // No Docker/S3 adapter ships in this repository (spec §1 Out of scope):
    // the in-memory `FakeRuntime` is the only `WorkspaceRuntime` this binary
    // constructs. A real deployment swaps this for its own adapter.
    let runtime: Arc<dyn WorkspaceRuntime> =
        Arc::new(FakeRuntime::new(config.workspace_defaults.resource_prefix.clone()));

    let state = AppState::new(config.clone(), db.clone(), redis.clone(), runtime.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    spawn_event_listener(&db, redis.clone(), shutdown_rx.clone());
    spawn_coordinators(&db, redis.clone(), runtime, config.clone(), shutdown_rx.clone()).await?;
    tokio::spawn(activity_flush::run(state.clone(), shutdown_rx.clone()));

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    info!(bind_addr = %config.server.bind_addr, "codehub-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal(shutdown_tx))
        .await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::router())
        .merge(proxy::router())
        .route("/events", get(sse::stream))
        .nest_service("/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn wait_for_shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

fn spawn_event_listener(db: &sqlx::PgPool, redis: ConnectionManager, shutdown_rx: tokio::sync::watch::Receiver<bool>) {
    let pool = db.clone();
    tokio::spawn(async move {
        let mut listener = EventListener::new(redis);
        let mut lock = PgAdvisoryLock::new(codehub_core::eventbus::LOCK_KEY);
        if let Err(err) = listener.run(&pool, &mut lock, shutdown_rx).await {
            tracing::error!(error = %err, "event listener exited");
        }
    });
}

async fn spawn_coordinators(
    db: &sqlx::PgPool,
    redis: ConnectionManager,
    runtime: Arc<dyn WorkspaceRuntime>,
    config: Arc<Config>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let observer_conn = db.acquire().await?.detach();
    let observer_notify = NotifySubscriber::new(redis.clone(), "observer");
    let observer = ObserverCoordinator::new(runtime.clone(), NotifyPublisher::new(redis.clone()));
    let shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut coordinator_loop = CoordinatorLoop::new(observer, observer_conn, Some(observer_notify));
        coordinator_loop.run(shutdown).await;
    });

    let wc_conn = db.acquire().await?.detach();
    let wc_notify = NotifySubscriber::new(redis.clone(), "wc");
    let wc = WcCoordinator::new(
        runtime.clone(),
        NotifyPublisher::new(redis.clone()),
        config.workspace_defaults.operation_timeout_seconds,
    );
    let shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut coordinator_loop = CoordinatorLoop::new(wc, wc_conn, Some(wc_notify));
        coordinator_loop.run(shutdown).await;
    });

    let scheduler_conn = db.acquire().await?.detach();
    let scheduler = SchedulerCoordinator::new(
        runtime,
        NotifyPublisher::new(redis.clone()),
        redis,
        config.workspace_defaults.resource_prefix.clone(),
    );
    tokio::spawn(async move {
        let mut coordinator_loop = CoordinatorLoop::new(scheduler, scheduler_conn, None);
        coordinator_loop.run(shutdown_rx).await;
    });

    Ok(())
}
