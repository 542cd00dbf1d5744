//! The wire contract.
//!
//! The inbound command set and outbound event set are closed: these enums are
//! the whole protocol, validated at the boundary by serde. Anything that does
//! not parse into [`ClientCommand`] is answered with an `error` event.
//!
//! Secrecy of the correct answer is structural here: [`PublicQuestion`] has
//! no correct-option field, and the only payloads that carry `correct_option`
//! are `answer:confirmed` (private to someone who has already answered) and
//! `question:ended` (after resolution).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampMilliSeconds};

use crate::error::EngineError;
use crate::mtch::{MatchId, MatchStatus, UserId};

/// A command sent by an authenticated participant over the socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum ClientCommand {
    #[serde(rename = "match:join")]
    Join { match_id: MatchId },

    #[serde(rename = "match:leave")]
    Leave { match_id: MatchId },

    #[serde(rename = "match:start")]
    Start { match_id: MatchId },

    #[serde(rename = "match:advance")]
    Advance { match_id: MatchId },

    #[serde(rename = "match:delete")]
    Delete { match_id: MatchId },

    #[serde(rename = "answer:submit")]
    SubmitAnswer {
        match_id: MatchId,
        question_number: u32,
        selected_option: String,

        /// Advisory only. The server measures response time itself.
        #[serde(default)]
        client_latency_hint_ms: Option<u64>,
    },
}

impl ClientCommand {
    pub fn match_id(&self) -> &MatchId {
        match self {
            ClientCommand::Join { match_id }
            | ClientCommand::Leave { match_id }
            | ClientCommand::Start { match_id }
            | ClientCommand::Advance { match_id }
            | ClientCommand::Delete { match_id }
            | ClientCommand::SubmitAnswer { match_id, .. } => match_id,
        }
    }
}

/// A question as shown to participants while it is still open.
#[derive(Debug, Clone, Serialize)]
pub struct PublicQuestion {
    pub question_number: u32,
    pub question_text: String,
    pub options: [String; 4],
    pub total_questions: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantView {
    pub user_id: UserId,
    pub score: i64,
}

/// A mid-match scoreboard line.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreboardEntry {
    pub user_id: UserId,
    pub score: i64,
}

/// A final scoreboard line, in settlement rank order.
#[derive(Debug, Clone, Serialize)]
pub struct FinalStanding {
    pub user_id: UserId,
    pub total_score: i64,
    pub correct_count: i64,
    pub avg_response_time_ms: Option<i64>,
}

/// The full public snapshot a joiner receives.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct MatchSnapshot {
    pub match_id: MatchId,
    pub host_id: UserId,
    pub status: MatchStatus,
    pub category: String,
    pub difficulty: String,
    pub question_duration_sec: u32,
    pub current_question_number: u32,
    pub total_questions: u32,
    pub participants: Vec<ParticipantView>,
    pub current_question: Option<PublicQuestion>,
    pub time_remaining_sec: Option<u32>,

    #[serde_as(as = "Option<TimestampMilliSeconds>")]
    pub started_at: Option<DateTime<Utc>>,
}

/// An event emitted by the engine.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum ServerEvent {
    /// Full snapshot, sent to a joiner.
    #[serde(rename = "match:state")]
    MatchState { state: MatchSnapshot },

    /// The match left the lobby. Carries the first question and is followed
    /// by `question:new` for it.
    #[serde(rename = "match:started")]
    MatchStarted {
        #[serde_as(as = "TimestampMilliSeconds")]
        started_at: DateTime<Utc>,
        question: PublicQuestion,
    },

    #[serde(rename = "question:new")]
    QuestionNew { question: PublicQuestion },

    #[serde(rename = "timer:start")]
    TimerStart { time_remaining_sec: u32 },

    #[serde(rename = "timer:tick")]
    TimerTick { time_remaining_sec: u32 },

    #[serde(rename = "timer:expired")]
    TimerExpired { time_remaining_sec: u32 },

    /// Private to the answerer. The only pre-resolution payload that carries
    /// the correct option.
    #[serde(rename = "answer:confirmed")]
    AnswerConfirmed {
        question_number: u32,
        is_correct: bool,
        correct_option: String,
        points_awarded: i64,
        new_score: i64,
    },

    /// Fan-out to the rest of the room: someone answered. No correctness, no
    /// option.
    #[serde(rename = "answer:received")]
    AnswerReceived { question_number: u32, user_id: UserId },

    #[serde(rename = "question:ended")]
    QuestionEnded {
        question_number: u32,
        correct_option: String,
        scoreboard: Vec<ScoreboardEntry>,
    },

    /// Terminal. `aborted` is set when settlement failed and the match was
    /// canceled instead of finished.
    #[serde(rename = "match:finished")]
    MatchFinished {
        scoreboard: Vec<FinalStanding>,
        winners: Vec<UserId>,
        aborted: bool,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn error(err: &EngineError) -> Self {
        ServerEvent::Error {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }
}
