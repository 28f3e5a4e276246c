//! Statement classification by leading keyword.

use crate::types::TransactionMode;

/// Transaction control statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// `BEGIN`, with an explicit mode if the statement names one.
    Begin(Option<TransactionMode>),
    /// `COMMIT` or `END`.
    Commit,
    /// `ROLLBACK`.
    Rollback,
}

/// Data modification statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// `INSERT`
    Insert,
    /// `UPDATE`
    Update,
    /// `DELETE`
    Delete,
}

/// Schema statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlKind {
    /// `CREATE`
    Create,
    /// `DROP`
    Drop,
    /// `ALTER`
    Alter,
}

/// How a statement is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    /// Transaction control, handled by the coordinator.
    Control(Control),
    /// Row-producing read.
    Read,
    /// Row modification.
    Write(WriteKind),
    /// Schema change.
    Ddl(DdlKind),
    /// Anything else; tried as a query, then as an exec.
    Unknown,
}

impl Statement {
    /// Classifies `sql` by its first keyword, ignoring case.
    #[must_use]
    pub fn classify(sql: &str) -> Self {
        let keyword = leading_keyword(sql);
        let is = |word: &str| keyword.eq_ignore_ascii_case(word);

        if is("BEGIN") || is("START") {
            Self::Control(Control::Begin(TransactionMode::from_instruction(sql)))
        } else if is("COMMIT") || is("END") {
            Self::Control(Control::Commit)
        } else if is("ROLLBACK") {
            Self::Control(Control::Rollback)
        } else if is("SELECT") {
            Self::Read
        } else if is("INSERT") {
            Self::Write(WriteKind::Insert)
        } else if is("UPDATE") {
            Self::Write(WriteKind::Update)
        } else if is("DELETE") {
            Self::Write(WriteKind::Delete)
        } else if is("CREATE") {
            Self::Ddl(DdlKind::Create)
        } else if is("DROP") {
            Self::Ddl(DdlKind::Drop)
        } else if is("ALTER") {
            Self::Ddl(DdlKind::Alter)
        } else {
            Self::Unknown
        }
    }

    /// Returns true if a successful run may change the database file.
    #[must_use]
    pub const fn may_write(&self) -> bool {
        matches!(self, Self::Write(_) | Self::Ddl(_) | Self::Unknown)
    }

    /// Builds the PostgreSQL command tag for a completed statement.
    #[must_use]
    pub fn command_tag(&self, sql: &str, rows: u64) -> String {
        match self {
            Self::Control(Control::Begin(_)) => "BEGIN".to_string(),
            Self::Control(Control::Commit) => "COMMIT".to_string(),
            Self::Control(Control::Rollback) => "ROLLBACK".to_string(),
            Self::Read => format!("SELECT {rows}"),
            Self::Write(WriteKind::Insert) => format!("INSERT 0 {rows}"),
            Self::Write(WriteKind::Update) => format!("UPDATE {rows}"),
            Self::Write(WriteKind::Delete) => format!("DELETE {rows}"),
            Self::Ddl(_) => {
                let mut words = sql.split_whitespace().take(2).map(str::to_ascii_uppercase);
                let first = words.next().unwrap_or_default();
                match words.next() {
                    Some(object) if object.chars().all(|c| c.is_ascii_alphabetic()) => {
                        format!("{first} {object}")
                    }
                    _ => first,
                }
            }
            Self::Unknown => leading_keyword(sql).to_ascii_uppercase(),
        }
    }
}

fn leading_keyword(sql: &str) -> &str {
    let trimmed = sql.trim_start();
    let end = trimmed
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}
