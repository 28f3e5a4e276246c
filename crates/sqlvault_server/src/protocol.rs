//! Line protocol spoken by the frontend.
//!
//! ```text
//! client: AUTH alice s3cret           server: OK AUTH
//! client: SELECT id, name FROM t      server: COLUMNS id:int8,name:text
//!                                     server: ROW 1|ann
//!                                     server: OK SELECT 1
//! client: \prepare ins INSERT INTO t (name) VALUES (?1)
//!                                     server: OK PREPARE ins 1
//! client: \execute ins 'bo b'         server: OK INSERT 0 1
//! client: \quit                       server: OK BYE
//! ```
//!
//! Cell values are escaped so a row is always one line: `\N` is NULL,
//! `\\`, `\|`, `\n` and `\r` stand for themselves, blobs are `\x` + hex.

use sqlvault_core::{CoreError, ErrorClass, Outcome, QueryResult, Value};
use std::fmt::Write as _;

/// One client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `AUTH <user> <password>`
    Auth {
        /// Principal name.
        user: String,
        /// Password.
        password: String,
    },
    /// A SQL statement.
    Query(String),
    /// `\prepare <name> <sql>`
    Prepare {
        /// Statement name.
        name: String,
        /// Statement text.
        sql: String,
    },
    /// `\execute <name> [params...]`
    Execute {
        /// Statement name.
        name: String,
        /// Bound values.
        params: Vec<Value>,
    },
    /// `\close <name>`
    Close {
        /// Statement name.
        name: String,
    },
    /// `\quit`
    Quit,
}

/// A request that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(at) => (&text[..at], text[at..].trim_start()),
        None => (text, ""),
    }
}

/// Parses one request line.
///
/// # Errors
///
/// Returns [`ParseError`] for malformed meta-commands.
pub fn parse_request(line: &str) -> Result<Request, ParseError> {
    let line = line.trim();
    let (word, rest) = split_word(line);

    if word.eq_ignore_ascii_case("AUTH") {
        let (user, password) = split_word(rest);
        if user.is_empty() {
            return Err(ParseError("AUTH requires a user name".into()));
        }
        return Ok(Request::Auth {
            user: user.to_string(),
            password: password.to_string(),
        });
    }

    let Some(command) = word.strip_prefix('\\') else {
        return Ok(Request::Query(line.to_string()));
    };
    let (name, rest) = split_word(rest);
    match command {
        "quit" | "q" => Ok(Request::Quit),
        "prepare" if !name.is_empty() && !rest.is_empty() => Ok(Request::Prepare {
            name: name.to_string(),
            sql: rest.to_string(),
        }),
        "execute" if !name.is_empty() => Ok(Request::Execute {
            name: name.to_string(),
            params: parse_params(rest)?,
        }),
        "close" if !name.is_empty() => Ok(Request::Close {
            name: name.to_string(),
        }),
        "prepare" => Err(ParseError("usage: \\prepare <name> <sql>".into())),
        "execute" => Err(ParseError("usage: \\execute <name> [params...]".into())),
        "close" => Err(ParseError("usage: \\close <name>".into())),
        other => Err(ParseError(format!("unknown command \\{other}"))),
    }
}

/// Splits parameters on whitespace.
///
/// Single quotes group a text value (`''` is a literal quote). Unquoted
/// tokens become integers or reals when they parse as such, `\N` is NULL,
/// anything else is text.
///
/// # Errors
///
/// Returns [`ParseError`] for an unterminated quote.
pub fn parse_params(text: &str) -> Result<Vec<Value>, ParseError> {
    let mut params = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            return Ok(params);
        };

        if first == '\'' {
            chars.next();
            let mut quoted = String::new();
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                        quoted.push('\'');
                    }
                    Some('\'') => break,
                    Some(c) => quoted.push(c),
                    None => return Err(ParseError("unterminated quoted parameter".into())),
                }
            }
            params.push(Value::Text(quoted));
        } else {
            let mut token = String::new();
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                token.push(c);
            }
            params.push(bare_value(&token));
        }
    }
}

fn bare_value(token: &str) -> Value {
    if token == "\\N" {
        Value::Null
    } else if let Ok(n) = token.parse::<i64>() {
        Value::Integer(n)
    } else if let Ok(f) = token.parse::<f64>() {
        if f.is_finite() {
            Value::Real(f)
        } else {
            Value::Text(token.to_string())
        }
    } else {
        Value::Text(token.to_string())
    }
}

/// Renders one cell.
#[must_use]
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "\\N".to_string(),
        Value::Integer(n) => n.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => escape(s),
        Value::Blob(bytes) => {
            let mut out = String::with_capacity(2 + bytes.len() * 2);
            out.push_str("\\x");
            for byte in bytes {
                let _ = write!(out, "{byte:02x}");
            }
            out
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn format_rows(result: &QueryResult) -> Vec<String> {
    let mut lines = Vec::with_capacity(result.rows.len() + 2);
    let columns: Vec<String> = result
        .columns
        .iter()
        .map(|c| format!("{}:{}", c.name, c.pg_type))
        .collect();
    lines.push(format!("COLUMNS {}", columns.join(",")));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(format_value).collect();
        lines.push(format!("ROW {}", cells.join("|")));
    }
    lines.push(format!("OK SELECT {}", result.rows.len()));
    lines
}

/// Renders a statement outcome as response lines.
#[must_use]
pub fn format_outcome(outcome: &Outcome) -> Vec<String> {
    match outcome {
        Outcome::Empty => vec!["OK EMPTY".to_string()],
        Outcome::Command { tag, .. } => vec![format!("OK {tag}")],
        Outcome::Rows(result) => format_rows(result),
    }
}

/// Renders an error line for a class and message.
#[must_use]
pub fn format_error(class: ErrorClass, message: &str) -> String {
    let message: String = message
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    format!("ERROR {} {}", class.sqlstate(), message)
}

/// Renders a core error.
#[must_use]
pub fn format_core_error(err: &CoreError) -> String {
    format_error(err.class(), &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sqlvault_core::Column;

    #[test]
    fn parses_statements_and_commands() {
        assert_eq!(
            parse_request("  SELECT 1 ").unwrap(),
            Request::Query("SELECT 1".into())
        );
        assert_eq!(
            parse_request("auth alice pw with spaces").unwrap(),
            Request::Auth {
                user: "alice".into(),
                password: "pw with spaces".into()
            }
        );
        assert_eq!(
            parse_request("\\prepare ins INSERT INTO t VALUES (?1)").unwrap(),
            Request::Prepare {
                name: "ins".into(),
                sql: "INSERT INTO t VALUES (?1)".into()
            }
        );
        assert_eq!(
            parse_request("\\execute ins 1 2.5 \\N 'a b' x").unwrap(),
            Request::Execute {
                name: "ins".into(),
                params: vec![
                    Value::Integer(1),
                    Value::Real(2.5),
                    Value::Null,
                    Value::Text("a b".into()),
                    Value::Text("x".into()),
                ]
            }
        );
        assert_eq!(
            parse_request("\\close ins").unwrap(),
            Request::Close { name: "ins".into() }
        );
        assert_eq!(parse_request("\\quit").unwrap(), Request::Quit);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_request("\\prepare onlyname").is_err());
        assert!(parse_request("\\execute").is_err());
        assert!(parse_request("\\frobnicate").is_err());
        assert!(parse_request("AUTH").is_err());
        assert!(parse_params("'open").is_err());
    }

    #[test]
    fn quoted_params() {
        assert_eq!(
            parse_params("'it''s' ''").unwrap(),
            vec![Value::Text("it's".into()), Value::Text(String::new())]
        );
        assert_eq!(parse_params("  ").unwrap(), Vec::<Value>::new());
        assert_eq!(parse_params("'42'").unwrap(), vec![Value::Text("42".into())]);
        assert_eq!(parse_params("inf").unwrap(), vec![Value::Text("inf".into())]);
    }

    #[test]
    fn escapes_cells() {
        assert_eq!(format_value(&Value::Null), "\\N");
        assert_eq!(format_value(&Value::Text("a|b\nc\\".into())), "a\\|b\\nc\\\\");
        assert_eq!(format_value(&Value::Blob(vec![0, 255])), "\\x00ff");
        assert_eq!(format_value(&Value::Real(1.5)), "1.5");
    }

    #[test]
    fn renders_rows() {
        let result = QueryResult {
            columns: vec![Column::new("id", Some("INTEGER")), Column::new("n", None)],
            rows: vec![vec![Value::Integer(1), Value::Text("x".into())]],
        };
        assert_eq!(
            format_outcome(&Outcome::Rows(result)),
            vec!["COLUMNS id:int8,n:text", "ROW 1|x", "OK SELECT 1"]
        );
        assert_eq!(
            format_outcome(&Outcome::Command {
                tag: "DELETE 2".into(),
                rows_affected: 2
            }),
            vec!["OK DELETE 2"]
        );
    }

    #[test]
    fn errors_stay_on_one_line() {
        assert_eq!(
            format_error(ErrorClass::SyntaxError, "near \"x\":\nsyntax error"),
            "ERROR 42601 near \"x\": syntax error"
        );
        assert_eq!(
            format_core_error(&CoreError::NoActiveTransaction),
            "ERROR 25P01 there is no transaction in progress"
        );
    }

    proptest! {
        #[test]
        fn escaped_text_is_one_line(text in ".*") {
            let cell = format_value(&Value::Text(text));
            prop_assert!(!cell.contains('\n'));
            prop_assert!(!cell.contains('\r'));
            prop_assert_eq!(cell.replace("\\|", "").matches('|').count(), 0);
        }
    }
}
