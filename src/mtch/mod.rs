//! Match module (`mtch` because `match` is a keyword).
//!
//! One `MatchRuntime` per active match, held behind a per-match async mutex:
//! every operation that mutates a match goes through that lock, which is what
//! serializes answer acceptance and makes the scoring order well-defined.
//! Operations on different matches run in parallel.

pub mod engine;
pub mod scoring;
pub mod timer;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::events::{MatchSnapshot, ParticipantView, ScoreboardEntry};
use crate::store::{MatchRow, ParticipantRow, QuestionInstanceRow};

/// Id for a given match (a v7 uuid, but stored as TEXT so it can be anything)
pub type MatchId = String;

/// Id for a user, owned by the external account system
pub type UserId = String;

/// Id for one question as used in one specific match
pub type QuestionInstanceId = String;

/// Match lifecycle. Monotonic, except that a scheduled match may jump
/// straight to canceled.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::AsRefStr,
    strum::EnumString,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum MatchStatus {
    Scheduled,
    Ongoing,
    Finished,
    Canceled,
}

/// Sub-state of the current question while the match is ongoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    /// Accepting answers.
    Asking,
    /// Revealed; waiting for advance (manual or the auto-advance delay).
    Resolved,
}

/// Runtime state for the question currently on screen.
pub struct QuestionRuntime {
    pub sub_state: SubState,

    /// Monotonic timestamp of the `question:new` broadcast. Response times
    /// are measured from here at the moment the executor accepts an answer.
    pub ask_started: Instant,

    /// Acceptance timestamp of the earliest correct answer so far. Monotonic
    /// minimum over the acceptance log; points already awarded are never
    /// retroactively adjusted.
    pub t_fastest: Option<Instant>,

    /// Who has an accepted answer for this question.
    pub answered: HashSet<UserId>,

    /// The 1 Hz countdown task, when armed.
    pub timer: Option<AbortHandle>,

    /// The one-shot auto-advance task, when armed.
    pub auto_advance: Option<AbortHandle>,
}

impl QuestionRuntime {
    pub fn asking(now: Instant) -> Self {
        Self {
            sub_state: SubState::Asking,
            ask_started: now,
            t_fastest: None,
            answered: HashSet::new(),
            timer: None,
            auto_advance: None,
        }
    }

    /// Cancel any outstanding timer tasks. Synchronous: the handles are
    /// aborted before the caller moves to the next state.
    pub fn cancel_timers(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(auto_advance) = self.auto_advance.take() {
            auto_advance.abort();
        }
    }
}

/// In-memory state for one match. Mirrors the store; the store stays the
/// authoritative copy and is what hydration reads on a fresh process.
pub struct MatchRuntime {
    pub mtch: MatchRow,
    pub participants: Vec<ParticipantRow>,
    /// Ordered by question number.
    pub questions: Vec<QuestionInstanceRow>,
    pub question: Option<QuestionRuntime>,
}

impl MatchRuntime {
    pub fn total_questions(&self) -> u32 {
        self.questions.len() as u32
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut ParticipantRow> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    /// The instance for the current question number, if the match has started.
    pub fn current_instance(&self) -> Option<&QuestionInstanceRow> {
        let number = self.mtch.current_question;
        if number < 1 {
            return None;
        }
        self.questions.get(number as usize - 1)
    }

    /// Current standings, best first. Stable on user id so equal scores
    /// don't jitter between broadcasts.
    pub fn scoreboard(&self) -> Vec<ScoreboardEntry> {
        let mut entries: Vec<_> = self
            .participants
            .iter()
            .map(|p| ScoreboardEntry {
                user_id: p.user_id.clone(),
                score: p.score,
            })
            .collect();
        entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.user_id.cmp(&b.user_id)));
        entries
    }

    /// Seconds left on the current question's countdown, while asking.
    pub fn time_remaining_sec(&self) -> Option<u32> {
        let question = self.question.as_ref()?;
        if question.sub_state != SubState::Asking {
            return None;
        }

        let duration = self.mtch.question_duration_sec as u64;
        let elapsed = question.ask_started.elapsed().as_secs();
        Some(duration.saturating_sub(elapsed) as u32)
    }

    /// The public view: everything a participant may see. The current
    /// question goes out as a `PublicQuestion`, which has no correct-option
    /// field at all.
    pub fn snapshot(&self) -> MatchSnapshot {
        let current_question = match self.question.as_ref().map(|q| q.sub_state) {
            Some(SubState::Asking) => self
                .current_instance()
                .map(|instance| instance.public_view(self.total_questions())),
            _ => None,
        };

        MatchSnapshot {
            match_id: self.mtch.match_id.clone(),
            host_id: self.mtch.host_id.clone(),
            status: self.mtch.status,
            category: self.mtch.category.clone(),
            difficulty: self.mtch.difficulty.clone(),
            question_duration_sec: self.mtch.question_duration_sec as u32,
            current_question_number: self.mtch.current_question.max(0) as u32,
            total_questions: self.total_questions(),
            participants: self
                .participants
                .iter()
                .map(|p| ParticipantView {
                    user_id: p.user_id.clone(),
                    score: p.score,
                })
                .collect(),
            current_question,
            time_remaining_sec: self.time_remaining_sec(),
            started_at: self.mtch.started_at,
        }
    }

    pub fn cancel_timers(&mut self) {
        if let Some(question) = self.question.as_mut() {
            question.cancel_timers();
        }
    }
}

/// One cell per match. The async mutex is the per-match executor: whoever
/// holds it is the only writer for that match.
pub type MatchCell = Arc<Mutex<Option<MatchRuntime>>>;

/// Registry of live match cells. Owned by the server context and dropped
/// with it.
#[derive(Default)]
pub struct MatchEngines {
    cells: std::sync::Mutex<HashMap<MatchId, MatchCell>>,
}

impl MatchEngines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cell for a match, creating an unhydrated one if needed.
    pub fn cell(&self, match_id: &str) -> MatchCell {
        let mut cells = self.cells.lock().expect("match registry poisoned");
        cells
            .entry(match_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Get the cell for a match only if it is already live. Timer callbacks
    /// use this so a stale firing can't resurrect an evicted match.
    pub fn peek(&self, match_id: &str) -> Option<MatchCell> {
        let cells = self.cells.lock().expect("match registry poisoned");
        cells.get(match_id).cloned()
    }

    /// Install a freshly created match.
    pub fn insert(&self, runtime: MatchRuntime) {
        let mut cells = self.cells.lock().expect("match registry poisoned");
        cells.insert(
            runtime.mtch.match_id.clone(),
            Arc::new(Mutex::new(Some(runtime))),
        );
    }

    pub fn remove(&self, match_id: &str) {
        let mut cells = self.cells.lock().expect("match registry poisoned");
        cells.remove(match_id);
    }

    #[allow(unused)]
    pub fn active_count(&self) -> usize {
        self.cells.lock().expect("match registry poisoned").len()
    }
}
