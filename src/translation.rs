//! Placeholder translation between `$N` (Postgres) and `?N` (SQLite) styles.
//!
//! Lets one statement text run against either engine. Quoted strings, quoted
//! identifiers, comments and dollar-quoted bodies are left untouched.

use std::borrow::Cow;

/// Placeholder dialect an engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ...
    Postgres,
    /// `?1`, `?2`, ...
    Sqlite,
}

impl PlaceholderStyle {
    /// Render placeholder number `n` (1-based).
    #[must_use]
    pub fn placeholder(self, n: usize) -> String {
        match self {
            PlaceholderStyle::Postgres => format!("${n}"),
            PlaceholderStyle::Sqlite => format!("?{n}"),
        }
    }
}

/// How to resolve translation for a call relative to the engine default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TranslationMode {
    /// Follow the engine's `translate_placeholders` option.
    #[default]
    EngineDefault,
    /// Always translate.
    ForceOn,
    /// Never translate.
    ForceOff,
}

impl TranslationMode {
    #[must_use]
    pub fn resolve(self, engine_default: bool) -> bool {
        match self {
            TranslationMode::EngineDefault => engine_default,
            TranslationMode::ForceOn => true,
            TranslationMode::ForceOff => false,
        }
    }
}

#[derive(Clone)]
enum Region {
    Code,
    Literal(u8),
    LineComment,
    BlockComment(u32),
    Dollar(String),
}

/// Translate placeholders into `target` style.
///
/// Returns a borrowed `Cow` when nothing changed or `enabled` is false.
#[must_use]
pub fn translate_placeholders(sql: &str, target: PlaceholderStyle, enabled: bool) -> Cow<'_, str> {
    if !enabled {
        return Cow::Borrowed(sql);
    }

    let bytes = sql.as_bytes();
    let (from, to) = match target {
        PlaceholderStyle::Sqlite => (b'$', '?'),
        PlaceholderStyle::Postgres => (b'?', '$'),
    };

    let mut out: Option<String> = None;
    // Start of the slice not yet copied into `out`.
    let mut copied = 0;
    let mut region = Region::Code;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match region {
            Region::Code => {
                if b == b'\'' || b == b'"' {
                    region = Region::Literal(b);
                } else if bytes[idx..].starts_with(b"--") {
                    region = Region::LineComment;
                    idx += 1;
                } else if bytes[idx..].starts_with(b"/*") {
                    region = Region::BlockComment(1);
                    idx += 1;
                } else if b == b'$'
                    && let Some((tag, close)) = dollar_tag(bytes, idx)
                {
                    region = Region::Dollar(tag);
                    idx = close;
                } else if b == from {
                    let digits = digit_run(bytes, idx + 1);
                    if digits > 0 {
                        let buf = out.get_or_insert_with(|| String::with_capacity(sql.len()));
                        buf.push_str(&sql[copied..idx]);
                        buf.push(to);
                        copied = idx + 1;
                        idx += digits;
                    }
                }
            }
            Region::Literal(quote) => {
                if b == quote {
                    if bytes.get(idx + 1) == Some(&quote) {
                        idx += 1;
                    } else {
                        region = Region::Code;
                    }
                }
            }
            Region::LineComment => {
                if b == b'\n' {
                    region = Region::Code;
                }
            }
            Region::BlockComment(depth) => {
                if bytes[idx..].starts_with(b"/*") {
                    region = Region::BlockComment(depth + 1);
                    idx += 1;
                } else if bytes[idx..].starts_with(b"*/") {
                    region = if depth == 1 {
                        Region::Code
                    } else {
                        Region::BlockComment(depth - 1)
                    };
                    idx += 1;
                }
            }
            Region::Dollar(ref tag) => {
                if b == b'$' && closes_tag(bytes, idx, tag) {
                    idx += tag.len() + 1;
                    region = Region::Code;
                }
            }
        }
        idx += 1;
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&sql[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(sql),
    }
}

fn digit_run(bytes: &[u8], start: usize) -> usize {
    bytes[start.min(bytes.len())..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count()
}

/// `$tag$` opening at `start`: returns the tag and the index of its closing `$`.
fn dollar_tag(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let rest = &bytes[start + 1..];
    let len = rest
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count();
    if rest.get(len) != Some(&b'$') {
        return None;
    }
    // `$1$` is not a tag; positional parameters start with a digit.
    if rest.first().is_some_and(u8::is_ascii_digit) {
        return None;
    }
    let tag = std::str::from_utf8(&rest[..len]).ok()?.to_string();
    Some((tag, start + 1 + len))
}

fn closes_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let body = &bytes[idx + 1..];
    body.starts_with(tag.as_bytes()) && body.get(tag.len()) == Some(&b'$')
}
