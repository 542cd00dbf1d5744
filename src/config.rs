use std::{env, net::SocketAddr, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Recognized engine options.
///
/// Everything here can be overridden with a `TRIVIA_`-prefixed environment
/// variable (e.g. `TRIVIA_QUESTION_DURATION_SEC=30`). The database connection
/// string stays in `DATABASE_URL`, read at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-question countdown in seconds.
    pub question_duration_sec: u32,

    /// Delay between a question resolving and the next one starting.
    pub auto_advance_delay_sec: u32,

    /// Upper bound on questions per match, validated at creation.
    pub max_questions_per_match: u32,

    /// Per-connection outbound queue capacity. Connections that fall this far
    /// behind are detached rather than allowed to stall the broadcast lane.
    pub broadcast_queue_cap: usize,

    /// Settlement transaction attempts before the match is canceled.
    pub settlement_retries: u32,

    /// How long an inbound command waits for the per-match executor.
    pub executor_acquire_timeout_ms: u64,

    /// How long shutdown waits for in-flight work before forcing termination.
    pub shutdown_grace_ms: u64,

    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: SocketAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            question_duration_sec: 20,
            auto_advance_delay_sec: 3,
            max_questions_per_match: 50,
            broadcast_queue_cap: 256,
            settlement_retries: 5,
            executor_acquire_timeout_ms: 2_000,
            shutdown_grace_ms: 5_000,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9944)),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        read_env("TRIVIA_QUESTION_DURATION_SEC", &mut config.question_duration_sec)?;
        read_env("TRIVIA_AUTO_ADVANCE_DELAY_SEC", &mut config.auto_advance_delay_sec)?;
        read_env("TRIVIA_MAX_QUESTIONS_PER_MATCH", &mut config.max_questions_per_match)?;
        read_env("TRIVIA_BROADCAST_QUEUE_CAP", &mut config.broadcast_queue_cap)?;
        read_env("TRIVIA_SETTLEMENT_RETRIES", &mut config.settlement_retries)?;
        read_env(
            "TRIVIA_EXECUTOR_ACQUIRE_TIMEOUT_MS",
            &mut config.executor_acquire_timeout_ms,
        )?;
        read_env("TRIVIA_SHUTDOWN_GRACE_MS", &mut config.shutdown_grace_ms)?;
        read_env("TRIVIA_BIND_ADDR", &mut config.bind_addr)?;

        Ok(config)
    }

    pub fn auto_advance_delay(&self) -> Duration {
        Duration::from_secs(self.auto_advance_delay_sec as u64)
    }

    pub fn executor_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_acquire_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn read_env<T: std::str::FromStr>(name: &str, slot: &mut T) -> anyhow::Result<()>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = env::var(name) {
        *slot = raw
            .parse()
            .with_context(|| format!("parsing `{name}` from environment"))?;
    }

    Ok(())
}
