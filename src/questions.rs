//! Question source: the finite pool the engine draws from at match creation.
//!
//! The pool itself is filled elsewhere (bulk import is somebody else's job);
//! the engine only ever asks for N random questions in a (category,
//! difficulty) bucket, shuffles each question's options once, and stores the
//! result as question instances. The stored order is what every participant
//! of that match sees.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{QuestionInstanceRow, StoreResult};
use crate::Db;

/// One question as it lives in the pool.
#[derive(Debug, Clone, FromRow)]
pub struct PoolQuestion {
    pub question_text: String,
    pub correct_option: String,
    pub wrong_option_1: String,
    pub wrong_option_2: String,
    pub wrong_option_3: String,
    pub content_hash: String,
}

#[async_trait]
pub trait QuestionSource: Send + Sync {
    /// Up to `n` random questions for a (category, difficulty) bucket.
    /// Returning fewer than `n` means the pool is too small for the request.
    async fn fetch_random(
        &self,
        category: &str,
        difficulty: &str,
        n: u32,
    ) -> StoreResult<Vec<PoolQuestion>>;
}

pub struct SqliteQuestionPool {
    db: Db,
}

impl SqliteQuestionPool {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl QuestionSource for SqliteQuestionPool {
    async fn fetch_random(
        &self,
        category: &str,
        difficulty: &str,
        n: u32,
    ) -> StoreResult<Vec<PoolQuestion>> {
        let questions = sqlx::query_as::<_, PoolQuestion>(
            "SELECT question_text, correct_option, wrong_option_1, wrong_option_2, wrong_option_3, content_hash
             FROM question_pool
             WHERE category = ? AND difficulty = ?
             ORDER BY RANDOM()
             LIMIT ?",
        )
        .bind(category)
        .bind(difficulty)
        .bind(n)
        .fetch_all(&self.db)
        .await?;

        Ok(questions)
    }
}

/// A canned source for tests and local seeding: hands out its questions in
/// order, as many as it has.
pub struct StaticQuestionSource {
    questions: Vec<PoolQuestion>,
}

impl StaticQuestionSource {
    pub fn new(questions: Vec<PoolQuestion>) -> Self {
        Self { questions }
    }
}

#[async_trait]
impl QuestionSource for StaticQuestionSource {
    async fn fetch_random(
        &self,
        _category: &str,
        _difficulty: &str,
        n: u32,
    ) -> StoreResult<Vec<PoolQuestion>> {
        if (self.questions.len() as u32) < n {
            return Err(StoreError::NotFound);
        }
        Ok(self.questions[..n as usize].to_vec())
    }
}

/// Turn pool questions into the per-match instances.
///
/// Each question's four options are shuffled exactly once here; the stored
/// order is final for the match and identical for every participant.
pub fn build_instances(
    match_id: &str,
    questions: Vec<PoolQuestion>,
    rng: &mut impl Rng,
) -> Vec<QuestionInstanceRow> {
    questions
        .into_iter()
        .enumerate()
        .map(|(index, question)| {
            let mut options = [
                question.correct_option.clone(),
                question.wrong_option_1,
                question.wrong_option_2,
                question.wrong_option_3,
            ];
            options.shuffle(rng);
            let [option_a, option_b, option_c, option_d] = options;

            QuestionInstanceRow {
                question_instance_id: Uuid::now_v7().hyphenated().to_string(),
                match_id: match_id.to_owned(),
                question_number: index as i64 + 1,
                question_text: question.question_text,
                option_a,
                option_b,
                option_c,
                option_d,
                correct_option: question.correct_option,
                content_hash: question.content_hash,
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn pool_question(correct: &str) -> PoolQuestion {
        PoolQuestion {
            question_text: "Chemical symbol for gold?".into(),
            correct_option: correct.into(),
            wrong_option_1: "Ag".into(),
            wrong_option_2: "Fe".into(),
            wrong_option_3: "Pb".into(),
            content_hash: "abc123".into(),
        }
    }

    #[test]
    fn instances_keep_the_correct_option_among_the_four() {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let instances = build_instances("m1", vec![pool_question("Au")], &mut rng);
            let instance = &instances[0];
            assert!(instance.has_option("Au"));
            assert!(instance.is_correct("Au"));
            assert_eq!(instance.question_number, 1);

            let mut sorted = instance.options().map(str::to_owned);
            sorted.sort();
            assert_eq!(sorted, ["Ag", "Au", "Fe", "Pb"]);
        }
    }

    #[test]
    fn instances_are_numbered_from_one() {
        let mut rng = rand::rng();
        let instances = build_instances(
            "m1",
            vec![pool_question("Au"), pool_question("Mars")],
            &mut rng,
        );
        let numbers: Vec<_> = instances.iter().map(|i| i.question_number).collect();
        assert_eq!(numbers, [1, 2]);
    }
}
