use lazy_static::lazy_static;
use regex::Regex;

use crate::translation::TranslationMode;
use crate::types::RowValues;

lazy_static! {
    // Leading comments and whitespace are skipped before the keyword test.
    static ref LEADING_NOISE: Regex =
        Regex::new(r"^(?:\s+|--[^\n]*(?:\n|$)|/\*(?s:.*?)\*/)*").expect("static regex");
    static ref READ_ONLY_KEYWORD: Regex =
        Regex::new(r"(?i)^(?:select|with|values|explain|show|pragma)\b").expect("static regex");
    static ref WRITING_CTE: Regex =
        Regex::new(r"(?i)\b(?:insert|update|delete|merge)\b").expect("static regex");
}

/// A SQL statement plus its positional parameters.
///
/// ```rust
/// use sql_session::prelude::*;
///
/// let stmt = Statement::new("SELECT name FROM users WHERE id = ?1").param(7);
/// assert!(stmt.is_read_only());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<RowValues>,
    translation: TranslationMode,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            translation: TranslationMode::default(),
        }
    }

    /// Replace the parameter list.
    #[must_use]
    pub fn params(mut self, params: Vec<RowValues>) -> Self {
        self.params = params;
        self
    }

    /// Append one parameter.
    #[must_use]
    pub fn param(mut self, value: impl Into<RowValues>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Override placeholder translation for this statement only.
    #[must_use]
    pub fn translation(mut self, mode: TranslationMode) -> Self {
        self.translation = mode;
        self
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn parameters(&self) -> &[RowValues] {
        &self.params
    }

    #[must_use]
    pub fn translation_mode(&self) -> TranslationMode {
        self.translation
    }

    /// True for statements that cannot change data.
    ///
    /// Owning calls skip the commit for these. `PRAGMA x = y` and CTEs that
    /// contain a data-modifying clause count as writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        let body = LEADING_NOISE
            .find(&self.sql)
            .map_or(self.sql.as_str(), |m| &self.sql[m.end()..]);
        let Some(keyword) = READ_ONLY_KEYWORD.find(body) else {
            return false;
        };
        match keyword.as_str().to_ascii_lowercase().as_str() {
            "pragma" => !body.contains('='),
            "with" => !WRITING_CTE.is_match(body),
            _ => true,
        }
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}
