//! The durable store behind the engine.
//!
//! The engine only ever talks to the [`Store`] trait: a narrow operation set
//! where every grouped write (answer + score bump, the whole settlement) is a
//! single atomic unit. `sqlite` is the real one; `memory` backs the test
//! suite and can inject failures.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::prelude::FromRow;

use crate::error::StoreError;
use crate::events::PublicQuestion;
use crate::mtch::{MatchId, MatchStatus, QuestionInstanceId, UserId};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, FromRow)]
pub struct MatchRow {
    pub match_id: MatchId,
    pub host_id: UserId,
    pub status: MatchStatus,
    pub category: String,
    pub difficulty: String,
    pub question_duration_sec: i64,

    /// 1-based; 0 before the match starts.
    pub current_question: i64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ParticipantRow {
    pub match_id: MatchId,
    pub user_id: UserId,
    pub score: i64,
    pub joined_at: DateTime<Utc>,
}

/// One question as used in one specific match. The four options are in the
/// order shown to every participant of this match, fixed at creation.
#[derive(Debug, Clone, FromRow)]
pub struct QuestionInstanceRow {
    pub question_instance_id: QuestionInstanceId,
    pub match_id: MatchId,
    pub question_number: i64,
    pub question_text: String,
    pub option_a: String,
    pub option_b: String,
    pub option_c: String,
    pub option_d: String,

    /// The exact string an answer is compared against, byte for byte.
    pub correct_option: String,

    /// Opaque pointer into the upstream question pool, for auditing only.
    pub content_hash: String,
}

impl QuestionInstanceRow {
    pub fn options(&self) -> [&str; 4] {
        [&self.option_a, &self.option_b, &self.option_c, &self.option_d]
    }

    pub fn has_option(&self, selected: &str) -> bool {
        self.options().contains(&selected)
    }

    pub fn is_correct(&self, selected: &str) -> bool {
        self.correct_option == selected
    }

    /// The view that goes over the wire before resolution. No correct option.
    pub fn public_view(&self, total_questions: u32) -> PublicQuestion {
        PublicQuestion {
            question_number: self.question_number as u32,
            question_text: self.question_text.clone(),
            options: self.options().map(str::to_owned),
            total_questions,
        }
    }
}

/// One participant's response (or auto-miss) to one question instance.
/// `selected_option` is `None` for a timeout auto-miss. Immutable once
/// written.
#[derive(Debug, Clone, FromRow)]
pub struct AnswerRow {
    pub question_instance_id: QuestionInstanceId,
    pub user_id: UserId,
    pub selected_option: Option<String>,
    pub is_correct: bool,
    pub response_time_ms: i64,
    pub points_awarded: i64,
}

/// Final per-match result for one participant, written exactly once at
/// settlement.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ScoreRow {
    pub match_id: MatchId,
    pub user_id: UserId,
    pub total_score: i64,
    pub correct_count: i64,
    pub total_questions: i64,

    /// Mean over answered questions only; `None` if nothing was answered.
    pub avg_response_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LifetimeStatsRow {
    pub user_id: UserId,
    pub games_played: i64,
    pub games_won: i64,
    pub total_score: i64,
    pub highest_score: i64,
    pub correct_answers: i64,
    pub total_answers: i64,
    pub avg_response_time_ms: f64,
    pub average_score: f64,
    pub last_played_at: Option<DateTime<Utc>>,
}

impl LifetimeStatsRow {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            games_played: 0,
            games_won: 0,
            total_score: 0,
            highest_score: 0,
            correct_answers: 0,
            total_answers: 0,
            avg_response_time_ms: 0.0,
            average_score: 0.0,
            last_played_at: None,
        }
    }

    /// Fold one settled match into the lifetime counters.
    ///
    /// The rolling response-time average is weighted by games played. A
    /// participant who answered nothing contributes `fallback_avg_ms` (the
    /// full question duration, which equals their recorded auto-miss times).
    pub fn apply_match(
        &mut self,
        score: &ScoreRow,
        won: bool,
        fallback_avg_ms: f64,
        now: DateTime<Utc>,
    ) {
        let match_avg = score
            .avg_response_time_ms
            .map(|ms| ms as f64)
            .unwrap_or(fallback_avg_ms);
        let games_before = self.games_played as f64;

        self.games_played += 1;
        if won {
            self.games_won += 1;
        }
        self.total_score += score.total_score;
        self.highest_score = self.highest_score.max(score.total_score);
        self.correct_answers += score.correct_count;
        self.total_answers += score.total_questions;
        self.avg_response_time_ms =
            (self.avg_response_time_ms * games_before + match_avg) / (games_before + 1.0);
        self.average_score = self.total_score as f64 / self.games_played as f64;
        self.last_played_at = Some(now);
    }
}

/// Everything settlement writes, computed up front so the store can commit it
/// as one transaction (or not at all).
#[derive(Debug, Clone)]
pub struct Settlement {
    pub match_id: MatchId,
    pub ended_at: DateTime<Utc>,
    pub question_duration_ms: i64,
    pub scores: Vec<ScoreRow>,
    pub winners: Vec<UserId>,
}

impl Settlement {
    pub fn is_winner(&self, user_id: &str) -> bool {
        self.winners.iter().any(|w| w == user_id)
    }
}

/// The operation set the engine consumes. Injected, so the engine never
/// knows which backend it is talking to.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new scheduled match with its host participant and question
    /// instances, atomically.
    async fn create_match(
        &self,
        mtch: MatchRow,
        host: ParticipantRow,
        questions: Vec<QuestionInstanceRow>,
    ) -> StoreResult<()>;

    async fn get_match(&self, match_id: &str) -> StoreResult<Option<MatchRow>>;

    async fn get_participants(&self, match_id: &str) -> StoreResult<Vec<ParticipantRow>>;

    /// Register a participant on a scheduled match. Idempotent.
    async fn add_participant(&self, participant: ParticipantRow) -> StoreResult<()>;

    /// Ordered by question number.
    async fn get_question_instances(&self, match_id: &str) -> StoreResult<Vec<QuestionInstanceRow>>;

    async fn get_answer(
        &self,
        question_instance_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<AnswerRow>>;

    async fn get_answers_for_match(&self, match_id: &str) -> StoreResult<Vec<AnswerRow>>;

    /// Insert an answer and bump the participant's running score in one
    /// transaction. Fails with [`StoreError::Duplicate`] if an answer already
    /// exists for this (question instance, user).
    async fn record_answer(&self, answer: AnswerRow, score_delta: i64) -> StoreResult<()>;

    /// Insert the synthetic auto-miss answers for a resolved question, in one
    /// transaction. Rows that already exist are left alone.
    async fn record_auto_misses(&self, answers: Vec<AnswerRow>) -> StoreResult<()>;

    /// Transition to ongoing: status, `started_at` and the first question
    /// number in one update.
    async fn mark_started(&self, match_id: &str, started_at: DateTime<Utc>) -> StoreResult<()>;

    async fn set_match_status(
        &self,
        match_id: &str,
        status: MatchStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn set_current_question(&self, match_id: &str, question_number: i64) -> StoreResult<()>;

    /// The settlement transaction: status to finished, one score row per
    /// participant, lifetime stats folded per participant. All or nothing.
    async fn commit_settlement(&self, settlement: &Settlement) -> StoreResult<()>;

    /// Remove a scheduled match and everything it owns. Scores and lifetime
    /// stats are history and survive.
    async fn delete_match_cascade(&self, match_id: &str) -> StoreResult<()>;

    async fn get_score(&self, match_id: &str, user_id: &str) -> StoreResult<Option<ScoreRow>>;

    async fn get_lifetime_stats(&self, user_id: &str) -> StoreResult<Option<LifetimeStatsRow>>;
}
