use serde::Serialize;
use thiserror::Error;

/// Errors a caller can trigger through the wire or HTTP surface.
///
/// None of these mutate match state. Each maps to a stable machine code that
/// goes out in `error` events, plus a human message from the `Error` impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineError {
    #[error("no such match")]
    NotFound,

    #[error("you are not a participant of this match")]
    NotAParticipant,

    #[error("only the host can do that")]
    NotHost,

    #[error("match has already started or finished")]
    NotScheduled,

    #[error("match has no participants")]
    NoPlayers,

    #[error("match is not ongoing")]
    MatchNotOngoing,

    #[error("that is not the current question")]
    WrongQuestion,

    #[error("you already answered this question")]
    AlreadyAnswered,

    #[error("selected option is not one of this question's options")]
    OptionNotRecognised,

    #[error("not valid in the current match phase")]
    WrongSubState,

    #[error("match was canceled")]
    Cancelled,

    #[error("not enough questions in the pool for this category and difficulty")]
    NotEnoughQuestions,

    #[error("too many questions requested for one match")]
    TooManyQuestions,

    /// Transient: the per-match executor or storage could not be reached in
    /// time. Safe to retry.
    #[error("busy, try again")]
    Busy,

    #[error("server is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Stable machine code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound => "not_found",
            EngineError::NotAParticipant => "not_a_participant",
            EngineError::NotHost => "not_host",
            EngineError::NotScheduled => "not_scheduled",
            EngineError::NoPlayers => "no_players",
            EngineError::MatchNotOngoing => "match_not_ongoing",
            EngineError::WrongQuestion => "wrong_question",
            EngineError::AlreadyAnswered => "already_answered",
            EngineError::OptionNotRecognised => "option_not_recognised",
            EngineError::WrongSubState => "wrong_sub_state",
            EngineError::Cancelled => "cancelled",
            EngineError::NotEnoughQuestions => "not_enough_questions",
            EngineError::TooManyQuestions => "too_many_questions",
            EngineError::Busy => "busy",
            EngineError::ShuttingDown => "shutting_down",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy | EngineError::ShuttingDown)
    }
}

/// Errors coming out of the store.
///
/// `Duplicate` is load-bearing: the answers table's primary key is what makes
/// double-answering impossible, and the engine turns that violation into
/// `AlreadyAnswered`. Everything else surfaces to callers as `Busy`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("row already exists")]
    Duplicate,

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Used by the in-memory store to inject failures in tests.
    #[error("storage unavailable")]
    Unavailable,
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Unavailable)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => EngineError::NotFound,
            StoreError::Duplicate => EngineError::AlreadyAnswered,
            StoreError::Database(_) | StoreError::Unavailable => EngineError::Busy,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(EngineError::AlreadyAnswered.code(), "already_answered");
        assert_eq!(EngineError::NotHost.code(), "not_host");
        assert_eq!(EngineError::Busy.code(), "busy");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(EngineError::Busy.is_retryable());
        assert!(EngineError::ShuttingDown.is_retryable());
        assert!(!EngineError::AlreadyAnswered.is_retryable());
        assert!(!EngineError::NotFound.is_retryable());
    }

    #[test]
    fn duplicate_store_rows_surface_as_already_answered() {
        assert_eq!(
            EngineError::from(StoreError::Duplicate),
            EngineError::AlreadyAnswered
        );
        assert_eq!(
            EngineError::from(StoreError::Unavailable),
            EngineError::Busy
        );
    }
}
