//! Error types for the collaborative sheet core.

use thiserror::Error;

/// Broad category of a [`SheetError`], used by callers to decide how to surface it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input rejected before any mutation.
    Validation,
    /// The actor is not allowed to perform the action right now.
    Authorization,
    /// The action collides with another user's collaborative state.
    Conflict,
    /// The addressed sheet or request does not exist.
    NotFound,
    /// Persistence, transport or codec failure.
    Io,
}

/// Errors that can occur while editing or synchronising a sheet
#[derive(Error, Debug)]
pub enum SheetError {
    #[error("cell out of range: row {row}, column {column}")]
    OutOfRange { row: usize, column: String },

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("column already exists: {0}")]
    DuplicateColumn(String),

    #[error("a sheet needs at least {min} column(s)")]
    TooFewColumns { min: usize },

    #[error("a sheet needs at least {min} rows")]
    TooFewRows { min: usize },

    #[error("invalid cell reference: {0}")]
    InvalidReference(String),

    #[error("invalid column formula: {}", .0.join("; "))]
    InvalidColumnFormula(Vec<String>),

    #[error("invalid merge: {0}")]
    InvalidMerge(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{role} users cannot modify sheets")]
    ReadOnly { role: String },

    #[error("sheet is locked by {name}")]
    LockedBy { name: String },

    #[error("only the lock holder or an administrator can release the lock")]
    NotLockHolder,

    #[error("this action requires an elevated role")]
    NotElevated,

    #[error("cell {cell_ref} is historical; an edit request was required")]
    NeedsApproval { cell_ref: String },

    #[error("cell {cell_ref} is being edited by {by}")]
    CellBusy { cell_ref: String, by: String },

    #[error("sheet is in use by {by}")]
    SheetBusy { by: String },

    #[error("edit request {0} is already resolved")]
    AlreadyResolved(i64),

    #[error("ledger columns for {0} already exist")]
    LedgerDayExists(String),

    #[error("sheet {0} not found")]
    SheetNotFound(i64),

    #[error("edit request {0} not found")]
    RequestNotFound(i64),

    #[error("persistence error: {0}")]
    Gateway(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("snapshot codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session is closed")]
    SessionClosed,
}

impl SheetError {
    pub fn kind(&self) -> ErrorKind {
        use SheetError::*;
        match self {
            OutOfRange { .. }
            | UnknownColumn(_)
            | DuplicateColumn(_)
            | TooFewColumns { .. }
            | TooFewRows { .. }
            | InvalidReference(_)
            | InvalidColumnFormula(_)
            | InvalidMerge(_)
            | InvalidConfig(_) => ErrorKind::Validation,
            ReadOnly { .. }
            | LockedBy { .. }
            | NotLockHolder
            | NotElevated
            | NeedsApproval { .. }
            | CellBusy { .. } => ErrorKind::Authorization,
            SheetBusy { .. } | AlreadyResolved(_) | LedgerDayExists(_) => ErrorKind::Conflict,
            SheetNotFound(_) | RequestNotFound(_) => ErrorKind::NotFound,
            Gateway(_) | Transport(_) | Codec(_) | Io(_) | Json(_) | SessionClosed => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, SheetError>;
