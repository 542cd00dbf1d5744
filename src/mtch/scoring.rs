//! Scoring: speed-discounted points, settlement math and the tie-break keys.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use rand::Rng;

use crate::store::{AnswerRow, MatchRow, ParticipantRow, QuestionInstanceRow, ScoreRow, Settlement};

pub const MAX_POINTS: i64 = 100;
pub const MIN_POINTS: i64 = 10;

/// One decay step: every 100 ms behind the fastest correct answer costs a
/// point.
const DECAY_STEP_MS: u128 = 100;

/// Points for a correct answer accepted `behind` the fastest correct answer
/// on the same question. The fastest correct responder is 0 behind and gets
/// the full 100; everyone else decays towards the floor of 10.
pub fn points_for_correct(behind: Duration) -> i64 {
    let steps = (behind.as_millis() / DECAY_STEP_MS) as i64;
    (MAX_POINTS - steps).clamp(MIN_POINTS, MAX_POINTS)
}

/// Jittered exponential backoff for settlement attempts: 100 ms base, ×4 per
/// attempt, capped at 1.6 s, scaled by ±50% jitter.
pub fn settlement_backoff(attempt: u32) -> Duration {
    let base_ms = (100u64 * 4u64.saturating_pow(attempt.saturating_sub(1))).min(1_600);
    let jitter = rand::rng().random_range(0.5..1.5);
    Duration::from_millis((base_ms as f64 * jitter) as u64)
}

/// Settlement ordering: higher total score, then higher correct count, then
/// lower average response time. Participants who answered nothing sort last
/// on the time key.
fn standing_order(a: &ScoreRow, b: &ScoreRow) -> Ordering {
    b.total_score
        .cmp(&a.total_score)
        .then_with(|| b.correct_count.cmp(&a.correct_count))
        .then_with(|| match (a.avg_response_time_ms, b.avg_response_time_ms) {
            (Some(a_ms), Some(b_ms)) => a_ms.cmp(&b_ms),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Compute everything settlement will write: one score row per participant in
/// final rank order, plus the co-winner set (everyone tied with the leader on
/// all three keys).
pub fn compute_settlement(
    mtch: &MatchRow,
    participants: &[ParticipantRow],
    questions: &[QuestionInstanceRow],
    answers: &[AnswerRow],
    ended_at: DateTime<Utc>,
) -> Settlement {
    // Only answers belonging to this match's question instances count.
    let instance_ids: HashSet<&str> = questions
        .iter()
        .map(|q| q.question_instance_id.as_str())
        .collect();

    let scores: Vec<ScoreRow> = participants
        .iter()
        .map(|participant| {
            let mut correct_count = 0i64;
            let mut answered_count = 0i64;
            let mut answered_time_ms = 0i64;

            for answer in answers.iter().filter(|a| {
                a.user_id == participant.user_id
                    && instance_ids.contains(a.question_instance_id.as_str())
            }) {
                if answer.is_correct {
                    correct_count += 1;
                }
                // Auto-misses have no selected option and don't count towards
                // the response-time average.
                if answer.selected_option.is_some() {
                    answered_count += 1;
                    answered_time_ms += answer.response_time_ms;
                }
            }

            ScoreRow {
                match_id: mtch.match_id.clone(),
                user_id: participant.user_id.clone(),
                total_score: participant.score,
                correct_count,
                total_questions: questions.len() as i64,
                avg_response_time_ms: (answered_count > 0)
                    .then(|| answered_time_ms / answered_count),
            }
        })
        .sorted_by(|a, b| standing_order(a, b).then_with(|| a.user_id.cmp(&b.user_id)))
        .collect();

    let winners = match scores.first() {
        Some(leader) => scores
            .iter()
            .take_while(|row| standing_order(leader, row) == Ordering::Equal)
            .map(|row| row.user_id.clone())
            .collect(),
        None => Vec::new(),
    };

    Settlement {
        match_id: mtch.match_id.clone(),
        ended_at,
        question_duration_ms: mtch.question_duration_sec * 1_000,
        scores,
        winners,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;

    #[test]
    fn fastest_correct_answer_gets_full_points() {
        assert_eq!(points_for_correct(Duration::ZERO), 100);
    }

    #[test]
    fn points_decay_one_per_hundred_millis() {
        assert_eq!(points_for_correct(Duration::from_millis(400)), 96);
        assert_eq!(points_for_correct(Duration::from_millis(123)), 99);
        assert_eq!(points_for_correct(Duration::from_millis(99)), 100);
    }

    #[test]
    fn points_never_fall_below_the_floor() {
        assert_eq!(points_for_correct(Duration::from_millis(9_000)), 10);
        assert_eq!(points_for_correct(Duration::from_secs(120)), 10);
    }

    #[test]
    fn settlement_backoff_is_bounded() {
        for attempt in 1..=6 {
            let delay = settlement_backoff(attempt);
            assert!(delay >= Duration::from_millis(50), "attempt {attempt}: {delay:?}");
            assert!(delay <= Duration::from_millis(2_400), "attempt {attempt}: {delay:?}");
        }
    }

    fn mtch() -> MatchRow {
        MatchRow {
            match_id: "m1".into(),
            host_id: "alice".into(),
            status: crate::mtch::MatchStatus::Ongoing,
            category: "science".into(),
            difficulty: "easy".into(),
            question_duration_sec: 20,
            current_question: 2,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
        }
    }

    fn participant(user_id: &str, score: i64) -> ParticipantRow {
        ParticipantRow {
            match_id: "m1".into(),
            user_id: user_id.into(),
            score,
            joined_at: Utc::now(),
        }
    }

    fn question(id: &str, number: i64) -> QuestionInstanceRow {
        QuestionInstanceRow {
            question_instance_id: id.into(),
            match_id: "m1".into(),
            question_number: number,
            question_text: "?".into(),
            option_a: "a".into(),
            option_b: "b".into(),
            option_c: "c".into(),
            option_d: "d".into(),
            correct_option: "a".into(),
            content_hash: "h".into(),
        }
    }

    fn answer(qi: &str, user_id: &str, correct: bool, ms: i64) -> AnswerRow {
        AnswerRow {
            question_instance_id: qi.into(),
            user_id: user_id.into(),
            selected_option: Some("a".into()),
            is_correct: correct,
            response_time_ms: ms,
            points_awarded: 0,
        }
    }

    #[test]
    fn tie_on_score_and_correct_breaks_on_speed() {
        let participants = [
            participant("a", 200),
            participant("b", 200),
            participant("c", 200),
        ];
        let questions = [question("q1", 1), question("q2", 2)];
        let answers = [
            answer("q1", "a", true, 2_000),
            answer("q2", "a", true, 3_000),
            answer("q1", "b", true, 2_400),
            answer("q2", "b", true, 2_000),
            answer("q1", "c", true, 3_000),
            answer("q2", "c", true, 3_000),
        ];

        let settlement =
            compute_settlement(&mtch(), &participants, &questions, &answers, Utc::now());

        assert_eq!(settlement.winners, vec!["b".to_string()]);
        let order: Vec<_> = settlement
            .scores
            .iter()
            .map(|s| s.user_id.as_str())
            .collect();
        assert_eq!(order, ["b", "a", "c"]);
        assert_eq!(settlement.scores[0].avg_response_time_ms, Some(2_200));
    }

    #[test]
    fn never_answered_sorts_last_on_the_time_key() {
        let participants = [participant("a", 0), participant("b", 0)];
        let questions = [question("q1", 1)];
        // a answered (wrong), b timed out.
        let mut wrong = answer("q1", "a", false, 5_000);
        wrong.selected_option = Some("b".into());
        let miss = AnswerRow {
            question_instance_id: "q1".into(),
            user_id: "b".into(),
            selected_option: None,
            is_correct: false,
            response_time_ms: 20_000,
            points_awarded: 0,
        };

        let settlement = compute_settlement(
            &mtch(),
            &participants,
            &questions,
            &[wrong, miss],
            Utc::now(),
        );

        assert_eq!(settlement.winners, vec!["a".to_string()]);
        assert_eq!(settlement.scores[1].avg_response_time_ms, None);
    }

    #[test]
    fn full_three_way_tie_crowns_co_winners() {
        let participants = [participant("a", 100), participant("b", 100)];
        let questions = [question("q1", 1)];
        let answers = [
            answer("q1", "a", true, 1_500),
            answer("q1", "b", true, 1_500),
        ];

        let settlement =
            compute_settlement(&mtch(), &participants, &questions, &answers, Utc::now());

        assert_eq!(settlement.winners, vec!["a".to_string(), "b".to_string()]);
    }
}
