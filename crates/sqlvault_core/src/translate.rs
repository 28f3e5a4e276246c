//! Engine error translation.
//!
//! SQLite reports failures as free text. Clients expect PostgreSQL SQLSTATE
//! codes, so every engine message is matched against an ordered table of
//! substrings. Specific patterns come before the generic ones they contain
//! (`UNIQUE constraint failed` before `constraint failed`).

use std::fmt;

/// Client-visible error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Duplicate key in a unique index.
    UniqueViolation,
    /// NULL written to a NOT NULL column.
    NotNullViolation,
    /// Foreign key reference broken.
    ForeignKeyViolation,
    /// CHECK constraint rejected a row.
    CheckViolation,
    /// Any other constraint failure.
    IntegrityConstraintViolation,
    /// Lock conflict with another connection.
    SerializationFailure,
    /// Disk or storage I/O failed.
    IoFailure,
    /// The database file is damaged or not a database.
    Corruption,
    /// Referenced table does not exist.
    UndefinedTable,
    /// Referenced column does not exist.
    UndefinedColumn,
    /// The statement could not be parsed.
    SyntaxError,
    /// The engine ran out of memory.
    OutOfMemory,
    /// The disk is full.
    DiskFull,
    /// BEGIN while a transaction is already open.
    ActiveTransaction,
    /// COMMIT or ROLLBACK with no open transaction.
    NoActiveTransaction,
    /// Statement issued while the transaction is failed.
    InFailedTransaction,
    /// Referenced prepared statement does not exist.
    UndefinedStatement,
    /// Authentication was rejected.
    InvalidPassword,
    /// No connection available within the acquire timeout.
    TooManyConnections,
    /// The server is shutting down.
    AdminShutdown,
    /// Anything not matched above.
    Internal,
}

impl ErrorClass {
    /// Returns the PostgreSQL SQLSTATE code for this class.
    #[must_use]
    pub const fn sqlstate(self) -> &'static str {
        match self {
            Self::UniqueViolation => "23505",
            Self::NotNullViolation => "23502",
            Self::ForeignKeyViolation => "23503",
            Self::CheckViolation => "23514",
            Self::IntegrityConstraintViolation => "23000",
            Self::SerializationFailure => "40001",
            Self::IoFailure => "58030",
            Self::Corruption => "XX001",
            Self::UndefinedTable => "42P01",
            Self::UndefinedColumn => "42703",
            Self::SyntaxError => "42601",
            Self::OutOfMemory => "53200",
            Self::DiskFull => "53100",
            Self::ActiveTransaction => "25001",
            Self::NoActiveTransaction => "25P01",
            Self::InFailedTransaction => "25P02",
            Self::UndefinedStatement => "26000",
            Self::InvalidPassword => "28P01",
            Self::TooManyConnections => "53300",
            Self::AdminShutdown => "57P01",
            Self::Internal => "XX000",
        }
    }

    /// Returns true for the transaction misuse classes.
    #[must_use]
    pub const fn is_misuse(self) -> bool {
        matches!(
            self,
            Self::ActiveTransaction | Self::NoActiveTransaction | Self::InFailedTransaction
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Ordered (pattern, class) pairs. First match wins.
pub const ERROR_PATTERNS: &[(&str, ErrorClass)] = &[
    ("UNIQUE constraint failed", ErrorClass::UniqueViolation),
    ("NOT NULL constraint failed", ErrorClass::NotNullViolation),
    ("FOREIGN KEY constraint failed", ErrorClass::ForeignKeyViolation),
    ("CHECK constraint failed", ErrorClass::CheckViolation),
    ("constraint failed", ErrorClass::IntegrityConstraintViolation),
    ("database is locked", ErrorClass::SerializationFailure),
    ("database table is locked", ErrorClass::SerializationFailure),
    ("disk I/O error", ErrorClass::IoFailure),
    ("database disk image is malformed", ErrorClass::Corruption),
    ("file is not a database", ErrorClass::Corruption),
    ("no such table", ErrorClass::UndefinedTable),
    ("no such column", ErrorClass::UndefinedColumn),
    ("syntax error", ErrorClass::SyntaxError),
    ("out of memory", ErrorClass::OutOfMemory),
    ("database or disk is full", ErrorClass::DiskFull),
    ("disk full", ErrorClass::DiskFull),
];

/// Classifies an engine error message.
#[must_use]
pub fn translate(message: &str) -> ErrorClass {
    ERROR_PATTERNS
        .iter()
        .find(|(pattern, _)| message.contains(pattern))
        .map_or(ErrorClass::Internal, |(_, class)| *class)
}
