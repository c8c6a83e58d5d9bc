//! Engine error taxonomy.

use crate::store::StoreError;
use boxworld_bits::{AddressError, CodecError, RngConfigError};
use boxworld_minesweeper::BoardError;
use derive_more::{Display, Error};

/// Classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum EngineErrorKind {
    /// Caller supplied an out-of-range index, width or count. Nothing changed.
    Validation,
    /// Mutation attempted on a game that has already ended (or never started).
    StateConflict,
    /// Persistence, pub/sub or another collaborator failed.
    Dependency,
    /// The addressed entity does not exist.
    NotFound,
}

/// Error returned by every actor and gateway operation.
#[derive(Debug, Clone, Display, Error)]
#[display("{} error: {} at {}:{}", kind, message, file, line)]
pub struct EngineError {
    /// What went wrong, coarsely.
    pub kind: EngineErrorKind,
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl EngineError {
    /// Creates a new engine error with caller location tracking.
    #[track_caller]
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }

    /// Caller error.
    #[track_caller]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Validation, message)
    }

    /// Mutation on an ended game.
    #[track_caller]
    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::StateConflict, message)
    }

    /// Collaborator failure.
    #[track_caller]
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Dependency, message)
    }

    /// Missing entity.
    #[track_caller]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NotFound, message)
    }

    /// The error's classification.
    pub fn kind(&self) -> EngineErrorKind {
        self.kind
    }
}

impl From<StoreError> for EngineError {
    #[track_caller]
    fn from(err: StoreError) -> Self {
        Self::dependency(err.to_string())
    }
}

impl From<CodecError> for EngineError {
    #[track_caller]
    fn from(err: CodecError) -> Self {
        Self::dependency(format!("stored page is corrupt: {}", err))
    }
}

impl From<RngConfigError> for EngineError {
    #[track_caller]
    fn from(err: RngConfigError) -> Self {
        Self::dependency(err.to_string())
    }
}

impl From<BoardError> for EngineError {
    #[track_caller]
    fn from(err: BoardError) -> Self {
        Self::validation(err.message)
    }
}

impl From<AddressError> for EngineError {
    #[track_caller]
    fn from(err: AddressError) -> Self {
        Self::validation(err.message)
    }
}
