//! In-memory store, mostly for the test suite.
//!
//! Same contract as the SQLite store, plus failure injection: tests can arm a
//! number of upcoming writes to fail with [`StoreError::Unavailable`], which
//! is how the settlement-retry and cancellation paths get exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::mtch::{MatchId, MatchStatus, UserId};
use crate::store::{
    AnswerRow, LifetimeStatsRow, MatchRow, ParticipantRow, QuestionInstanceRow, ScoreRow,
    Settlement, Store, StoreResult,
};

#[derive(Default)]
struct Inner {
    matches: HashMap<MatchId, MatchRow>,
    participants: HashMap<MatchId, Vec<ParticipantRow>>,
    questions: HashMap<MatchId, Vec<QuestionInstanceRow>>,
    instance_match: HashMap<String, MatchId>,
    answers: Vec<AnswerRow>,
    scores: HashMap<(MatchId, UserId), ScoreRow>,
    stats: HashMap<UserId, LifetimeStatsRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_settlements: AtomicU32,
    fail_answer_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` settlement commits fail.
    pub fn fail_next_settlements(&self, n: u32) {
        self.fail_settlements.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` answer writes fail.
    pub fn fail_next_answer_writes(&self, n: u32) {
        self.fail_answer_writes.store(n, Ordering::SeqCst);
    }

    pub fn answer_count(&self) -> usize {
        self.inner.lock().expect("memory store poisoned").answers.len()
    }
}

/// Decrement-if-positive; true means this call should fail.
fn consume(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_match(
        &self,
        mtch: MatchRow,
        host: ParticipantRow,
        questions: Vec<QuestionInstanceRow>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");

        if inner.matches.contains_key(&mtch.match_id) {
            return Err(StoreError::Duplicate);
        }

        for question in &questions {
            inner
                .instance_match
                .insert(question.question_instance_id.clone(), mtch.match_id.clone());
        }
        inner.participants.insert(mtch.match_id.clone(), vec![host]);
        inner.questions.insert(mtch.match_id.clone(), questions);
        inner.matches.insert(mtch.match_id.clone(), mtch);
        Ok(())
    }

    async fn get_match(&self, match_id: &str) -> StoreResult<Option<MatchRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.matches.get(match_id).cloned())
    }

    async fn get_participants(&self, match_id: &str) -> StoreResult<Vec<ParticipantRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.participants.get(match_id).cloned().unwrap_or_default())
    }

    async fn add_participant(&self, participant: ParticipantRow) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let room = inner
            .participants
            .entry(participant.match_id.clone())
            .or_default();
        if !room.iter().any(|p| p.user_id == participant.user_id) {
            room.push(participant);
        }
        Ok(())
    }

    async fn get_question_instances(
        &self,
        match_id: &str,
    ) -> StoreResult<Vec<QuestionInstanceRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.questions.get(match_id).cloned().unwrap_or_default())
    }

    async fn get_answer(
        &self,
        question_instance_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<AnswerRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .answers
            .iter()
            .find(|a| a.question_instance_id == question_instance_id && a.user_id == user_id)
            .cloned())
    }

    async fn get_answers_for_match(&self, match_id: &str) -> StoreResult<Vec<AnswerRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .answers
            .iter()
            .filter(|a| {
                inner
                    .instance_match
                    .get(&a.question_instance_id)
                    .is_some_and(|m| m == match_id)
            })
            .cloned()
            .collect())
    }

    async fn record_answer(&self, answer: AnswerRow, score_delta: i64) -> StoreResult<()> {
        if consume(&self.fail_answer_writes) {
            return Err(StoreError::Unavailable);
        }

        let mut inner = self.inner.lock().expect("memory store poisoned");

        if inner.answers.iter().any(|a| {
            a.question_instance_id == answer.question_instance_id && a.user_id == answer.user_id
        }) {
            return Err(StoreError::Duplicate);
        }

        let match_id = inner
            .instance_match
            .get(&answer.question_instance_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        if score_delta != 0 {
            if let Some(participant) = inner
                .participants
                .get_mut(&match_id)
                .and_then(|ps| ps.iter_mut().find(|p| p.user_id == answer.user_id))
            {
                participant.score += score_delta;
            }
        }

        inner.answers.push(answer);
        Ok(())
    }

    async fn record_auto_misses(&self, answers: Vec<AnswerRow>) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        for answer in answers {
            let exists = inner.answers.iter().any(|a| {
                a.question_instance_id == answer.question_instance_id && a.user_id == answer.user_id
            });
            if !exists {
                inner.answers.push(answer);
            }
        }
        Ok(())
    }

    async fn mark_started(&self, match_id: &str, started_at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let mtch = inner.matches.get_mut(match_id).ok_or(StoreError::NotFound)?;
        mtch.status = MatchStatus::Ongoing;
        mtch.started_at = Some(started_at);
        mtch.current_question = 1;
        Ok(())
    }

    async fn set_match_status(
        &self,
        match_id: &str,
        status: MatchStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let mtch = inner.matches.get_mut(match_id).ok_or(StoreError::NotFound)?;
        mtch.status = status;
        if ended_at.is_some() {
            mtch.ended_at = ended_at;
        }
        Ok(())
    }

    async fn set_current_question(&self, match_id: &str, question_number: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let mtch = inner.matches.get_mut(match_id).ok_or(StoreError::NotFound)?;
        mtch.current_question = question_number;
        Ok(())
    }

    async fn commit_settlement(&self, settlement: &Settlement) -> StoreResult<()> {
        if consume(&self.fail_settlements) {
            return Err(StoreError::Unavailable);
        }

        let mut inner = self.inner.lock().expect("memory store poisoned");

        {
            let mtch = inner
                .matches
                .get_mut(&settlement.match_id)
                .ok_or(StoreError::NotFound)?;
            mtch.status = MatchStatus::Finished;
            mtch.ended_at = Some(settlement.ended_at);
        }

        for score in &settlement.scores {
            inner.scores.insert(
                (settlement.match_id.clone(), score.user_id.clone()),
                score.clone(),
            );

            let stats = inner
                .stats
                .entry(score.user_id.clone())
                .or_insert_with(|| LifetimeStatsRow::empty(score.user_id.clone()));
            stats.apply_match(
                score,
                settlement.is_winner(&score.user_id),
                settlement.question_duration_ms as f64,
                settlement.ended_at,
            );
        }

        Ok(())
    }

    async fn delete_match_cascade(&self, match_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.matches.remove(match_id);
        inner.participants.remove(match_id);
        if let Some(questions) = inner.questions.remove(match_id) {
            for question in &questions {
                inner.instance_match.remove(&question.question_instance_id);
            }
            inner.answers.retain(|a| {
                !questions
                    .iter()
                    .any(|q| q.question_instance_id == a.question_instance_id)
            });
        }
        Ok(())
    }

    async fn get_score(&self, match_id: &str, user_id: &str) -> StoreResult<Option<ScoreRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .scores
            .get(&(match_id.to_owned(), user_id.to_owned()))
            .cloned())
    }

    async fn get_lifetime_stats(&self, user_id: &str) -> StoreResult<Option<LifetimeStatsRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.stats.get(user_id).cloned())
    }
}
