//! Per-match timer tasks.
//!
//! At most one countdown exists per match at any instant: the engine stores
//! the abort handle in the question runtime and aborts it synchronously
//! before any state transition that supersedes it. Cadence comes from the
//! tokio clock, which is monotonic; wall-clock adjustments don't touch it.

use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

use crate::events::ServerEvent;
use crate::mtch::{engine, MatchId};
use crate::ServerCtx;

/// Arm the 1 Hz countdown for the current question.
///
/// The caller has already broadcast `timer:start`; this task emits one
/// `timer:tick` per second counting down to zero, then hands expiry to the
/// engine (which re-checks that the question is still open before resolving).
pub fn start_question_timer(
    ctx: &ServerCtx,
    match_id: MatchId,
    question_number: i64,
    duration_sec: u32,
) -> AbortHandle {
    let task_ctx = ctx.clone();
    let shutdown = ctx.shutdown.clone();

    ctx.tracker
        .spawn(async move {
            let countdown = async {
                for remaining in (0..duration_sec).rev() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    task_ctx.rooms.broadcast(
                        &match_id,
                        ServerEvent::TimerTick {
                            time_remaining_sec: remaining,
                        },
                    );
                }

                if let Err(err) =
                    engine::handle_timer_expired(&task_ctx, &match_id, question_number).await
                {
                    debug!(%match_id, question_number, "timer expiry dropped: {err}");
                }
            };

            tokio::select! {
                () = countdown => {}
                () = shutdown.cancelled() => {}
            }
        })
        .abort_handle()
}

/// Arm the one-shot delay between a question resolving and the next one
/// starting (or the match settling, after the last question).
pub fn start_auto_advance(
    ctx: &ServerCtx,
    match_id: MatchId,
    question_number: i64,
    delay: Duration,
) -> AbortHandle {
    let task_ctx = ctx.clone();
    let shutdown = ctx.shutdown.clone();

    ctx.tracker
        .spawn(async move {
            let advance = async {
                tokio::time::sleep(delay).await;
                if let Err(err) =
                    engine::handle_auto_advance(&task_ctx, &match_id, question_number).await
                {
                    debug!(%match_id, question_number, "auto-advance dropped: {err}");
                }
            };

            tokio::select! {
                () = advance => {}
                () = shutdown.cancelled() => {}
            }
        })
        .abort_handle()
}
