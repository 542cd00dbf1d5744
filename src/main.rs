mod auth;
mod config;
mod dispatch;
mod error;
mod events;
mod mtch;
mod questions;
mod room;
mod store;

use std::{env, str::FromStr, sync::Arc};

use sqlx::{sqlite::SqliteConnectOptions, Pool, Sqlite, SqlitePool};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::auth::{Identity, SqliteIdentity};
use crate::config::EngineConfig;
use crate::mtch::MatchEngines;
use crate::questions::{QuestionSource, SqliteQuestionPool};
use crate::room::RoomRegistry;
use crate::store::{sqlite::SqliteStore, Store};

pub type Db = Pool<Sqlite>;

/// Everything the engine, timers and dispatcher share. Cheap to clone; the
/// registries live exactly as long as this does.
#[derive(Clone)]
pub struct ServerCtx {
    pub store: Arc<dyn Store>,
    pub identity: Arc<dyn Identity>,
    pub questions: Arc<dyn QuestionSource>,
    pub rooms: Arc<RoomRegistry>,
    pub engines: Arc<MatchEngines>,
    pub config: Arc<EngineConfig>,

    /// Cancelled once at shutdown; timers and socket loops all select on it.
    pub shutdown: CancellationToken,

    /// Tracks every spawned task so shutdown can wait for them (bounded).
    pub tracker: TaskTracker,
}

#[tokio::main]
async fn main() {
    // Init tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = EngineConfig::from_env().expect("Invalid engine configuration");

    // Setup db connection
    let db_conn_string = env::var("DATABASE_URL")
        .expect("`DATABASE_URL` environment variable must contain a connection string");

    let db = SqlitePool::connect_with(
        SqliteConnectOptions::from_str(&db_conn_string)
            .expect("Invalid database connection string")
            .create_if_missing(true)
            .foreign_keys(true),
    )
    .await
    .expect("Could not open database");

    // Run migrations
    info!("Running db migrations");
    sqlx::migrate!().run(&db).await.expect("Migrations failed");

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    let ctx = ServerCtx {
        store: Arc::new(SqliteStore::new(db.clone())),
        identity: Arc::new(SqliteIdentity::new(db.clone())),
        questions: Arc::new(SqliteQuestionPool::new(db)),
        rooms: Arc::new(RoomRegistry::new()),
        engines: Arc::new(MatchEngines::new()),
        config: Arc::new(config),
        shutdown: token.clone(),
        tracker: tracker.clone(),
    };

    let router = dispatch::router(ctx.clone());

    // Start the server
    tracker.spawn({
        let token = token.clone();
        let bind_addr = ctx.config.bind_addr;

        let listener = TcpListener::bind(&bind_addr)
            .await
            .expect("Could not bind listener");
        info!("Listening at {bind_addr}");
        let serve = axum::serve(listener, router);

        async move {
            tokio::select! {
                result = serve => {
                    result.expect("Server stopped unexpectedly");
                },
                () = token.cancelled() => {},
            }
        }
    });

    // Wait for shutdown signal...
    tokio::signal::ctrl_c()
        .await
        .expect("Could not listen for shutdown signal");
    info!("Shutting down...");

    // Refuse new work, cancel timers, then give in-flight tasks a bounded
    // window to drain.
    token.cancel();
    tracker.close();
    if tokio::time::timeout(ctx.config.shutdown_grace(), tracker.wait())
        .await
        .is_err()
    {
        warn!("Shutdown grace period elapsed, terminating with tasks still running");
    }
}
