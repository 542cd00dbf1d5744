//! The SQLite store.
//!
//! Grouped writes run inside one transaction each; the answers table's
//! primary key is the source of truth for answer uniqueness and surfaces as
//! [`StoreError::Duplicate`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::mtch::MatchStatus;
use crate::store::{
    AnswerRow, LifetimeStatsRow, MatchRow, ParticipantRow, QuestionInstanceRow, ScoreRow,
    Settlement, Store, StoreResult,
};
use crate::Db;

pub struct SqliteStore {
    db: Db,
}

impl SqliteStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn map_insert_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_match(
        &self,
        mtch: MatchRow,
        host: ParticipantRow,
        questions: Vec<QuestionInstanceRow>,
    ) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO matches (match_id, host_id, status, category, difficulty,
                                  question_duration_sec, current_question, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&mtch.match_id)
        .bind(&mtch.host_id)
        .bind(mtch.status)
        .bind(&mtch.category)
        .bind(&mtch.difficulty)
        .bind(mtch.question_duration_sec)
        .bind(mtch.current_question)
        .bind(mtch.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO participants (match_id, user_id, score, joined_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&host.match_id)
        .bind(&host.user_id)
        .bind(host.score)
        .bind(host.joined_at)
        .execute(&mut *tx)
        .await?;

        for question in &questions {
            sqlx::query(
                "INSERT INTO question_instances
                     (question_instance_id, match_id, question_number, question_text,
                      option_a, option_b, option_c, option_d, correct_option, content_hash)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&question.question_instance_id)
            .bind(&question.match_id)
            .bind(question.question_number)
            .bind(&question.question_text)
            .bind(&question.option_a)
            .bind(&question.option_b)
            .bind(&question.option_c)
            .bind(&question.option_d)
            .bind(&question.correct_option)
            .bind(&question.content_hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_match(&self, match_id: &str) -> StoreResult<Option<MatchRow>> {
        let row = sqlx::query_as::<_, MatchRow>("SELECT * FROM matches WHERE match_id = ?")
            .bind(match_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row)
    }

    async fn get_participants(&self, match_id: &str) -> StoreResult<Vec<ParticipantRow>> {
        let rows = sqlx::query_as::<_, ParticipantRow>(
            "SELECT * FROM participants WHERE match_id = ? ORDER BY joined_at, user_id",
        )
        .bind(match_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn add_participant(&self, participant: ParticipantRow) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO participants (match_id, user_id, score, joined_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (match_id, user_id) DO NOTHING",
        )
        .bind(&participant.match_id)
        .bind(&participant.user_id)
        .bind(participant.score)
        .bind(participant.joined_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_question_instances(
        &self,
        match_id: &str,
    ) -> StoreResult<Vec<QuestionInstanceRow>> {
        let rows = sqlx::query_as::<_, QuestionInstanceRow>(
            "SELECT * FROM question_instances WHERE match_id = ? ORDER BY question_number",
        )
        .bind(match_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn get_answer(
        &self,
        question_instance_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<AnswerRow>> {
        let row = sqlx::query_as::<_, AnswerRow>(
            "SELECT * FROM answers WHERE question_instance_id = ? AND user_id = ?",
        )
        .bind(question_instance_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn get_answers_for_match(&self, match_id: &str) -> StoreResult<Vec<AnswerRow>> {
        let rows = sqlx::query_as::<_, AnswerRow>(
            "SELECT a.* FROM answers a
             JOIN question_instances qi ON qi.question_instance_id = a.question_instance_id
             WHERE qi.match_id = ?
             ORDER BY qi.question_number, a.user_id",
        )
        .bind(match_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn record_answer(&self, answer: AnswerRow, score_delta: i64) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO answers (question_instance_id, user_id, selected_option,
                                  is_correct, response_time_ms, points_awarded)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&answer.question_instance_id)
        .bind(&answer.user_id)
        .bind(&answer.selected_option)
        .bind(answer.is_correct)
        .bind(answer.response_time_ms)
        .bind(answer.points_awarded)
        .execute(&mut *tx)
        .await
        .map_err(map_insert_err)?;

        if score_delta != 0 {
            sqlx::query(
                "UPDATE participants SET score = score + ?
                 WHERE user_id = ?
                   AND match_id = (SELECT match_id FROM question_instances
                                   WHERE question_instance_id = ?)",
            )
            .bind(score_delta)
            .bind(&answer.user_id)
            .bind(&answer.question_instance_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn record_auto_misses(&self, answers: Vec<AnswerRow>) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        for answer in &answers {
            sqlx::query(
                "INSERT OR IGNORE INTO answers
                     (question_instance_id, user_id, selected_option,
                      is_correct, response_time_ms, points_awarded)
                 VALUES (?, ?, NULL, ?, ?, ?)",
            )
            .bind(&answer.question_instance_id)
            .bind(&answer.user_id)
            .bind(answer.is_correct)
            .bind(answer.response_time_ms)
            .bind(answer.points_awarded)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_started(&self, match_id: &str, started_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE matches SET status = ?, started_at = ?, current_question = 1
             WHERE match_id = ?",
        )
        .bind(MatchStatus::Ongoing)
        .bind(started_at)
        .bind(match_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn set_match_status(
        &self,
        match_id: &str,
        status: MatchStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE matches SET status = ?, ended_at = COALESCE(?, ended_at) WHERE match_id = ?")
            .bind(status)
            .bind(ended_at)
            .bind(match_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn set_current_question(&self, match_id: &str, question_number: i64) -> StoreResult<()> {
        sqlx::query("UPDATE matches SET current_question = ? WHERE match_id = ?")
            .bind(question_number)
            .bind(match_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn commit_settlement(&self, settlement: &Settlement) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("UPDATE matches SET status = ?, ended_at = ? WHERE match_id = ?")
            .bind(MatchStatus::Finished)
            .bind(settlement.ended_at)
            .bind(&settlement.match_id)
            .execute(&mut *tx)
            .await?;

        for score in &settlement.scores {
            sqlx::query(
                "INSERT INTO scores (match_id, user_id, total_score, correct_count,
                                     total_questions, avg_response_time_ms)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (match_id, user_id) DO UPDATE SET
                     total_score = excluded.total_score,
                     correct_count = excluded.correct_count,
                     total_questions = excluded.total_questions,
                     avg_response_time_ms = excluded.avg_response_time_ms",
            )
            .bind(&score.match_id)
            .bind(&score.user_id)
            .bind(score.total_score)
            .bind(score.correct_count)
            .bind(score.total_questions)
            .bind(score.avg_response_time_ms)
            .execute(&mut *tx)
            .await?;

            let existing = sqlx::query_as::<_, LifetimeStatsRow>(
                "SELECT * FROM lifetime_stats WHERE user_id = ?",
            )
            .bind(&score.user_id)
            .fetch_optional(&mut *tx)
            .await?;

            let mut stats =
                existing.unwrap_or_else(|| LifetimeStatsRow::empty(score.user_id.clone()));
            stats.apply_match(
                score,
                settlement.is_winner(&score.user_id),
                settlement.question_duration_ms as f64,
                settlement.ended_at,
            );

            sqlx::query(
                "INSERT INTO lifetime_stats
                     (user_id, games_played, games_won, total_score, highest_score,
                      correct_answers, total_answers, avg_response_time_ms,
                      average_score, last_played_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (user_id) DO UPDATE SET
                     games_played = excluded.games_played,
                     games_won = excluded.games_won,
                     total_score = excluded.total_score,
                     highest_score = excluded.highest_score,
                     correct_answers = excluded.correct_answers,
                     total_answers = excluded.total_answers,
                     avg_response_time_ms = excluded.avg_response_time_ms,
                     average_score = excluded.average_score,
                     last_played_at = excluded.last_played_at",
            )
            .bind(&stats.user_id)
            .bind(stats.games_played)
            .bind(stats.games_won)
            .bind(stats.total_score)
            .bind(stats.highest_score)
            .bind(stats.correct_answers)
            .bind(stats.total_answers)
            .bind(stats.avg_response_time_ms)
            .bind(stats.average_score)
            .bind(stats.last_played_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_match_cascade(&self, match_id: &str) -> StoreResult<()> {
        // Relies on `PRAGMA foreign_keys = ON` (set on the pool) for the
        // cascade into participants, question instances and answers.
        sqlx::query("DELETE FROM matches WHERE match_id = ?")
            .bind(match_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn get_score(&self, match_id: &str, user_id: &str) -> StoreResult<Option<ScoreRow>> {
        let row = sqlx::query_as::<_, ScoreRow>(
            "SELECT * FROM scores WHERE match_id = ? AND user_id = ?",
        )
        .bind(match_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn get_lifetime_stats(&self, user_id: &str) -> StoreResult<Option<LifetimeStatsRow>> {
        let row =
            sqlx::query_as::<_, LifetimeStatsRow>("SELECT * FROM lifetime_stats WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row)
    }
}
