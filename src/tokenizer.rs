//! Quote-aware SQL tokenizer using nom.
//!
//! SQL text is split into alternating runs of raw SQL and single-quoted
//! literals, so no rewrite ever touches the inside of a string literal.
//!
//! ```text
//! UPDATE t SET note = 'it''s TRUE' WHERE flag = TRUE
//! ─────────┬───────── ──────┬───── ────────┬────────
//!          │                │                └── Sql
//!          │                └── Quoted (kept byte-for-byte)
//!          └── Sql
//! ```
//!
//! Literals use `'...'` with either `''` or `\'` as the embedded quote, and
//! `\\` for a backslash. A backslash always pairs with the character after
//! it, so `'C:\'` is unterminated; write `'C:\\'`.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_till1},
    character::complete::{anychar, char},
    combinator::{map, recognize},
    multi::many0_count,
    sequence::{pair, tuple},
    IResult,
};

/// Kind of a token run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// A single-quoted literal, quotes included.
    Quoted,
    /// Everything else.
    Sql,
}

/// A slice of the input with its byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub offset: usize,
}

impl Token<'_> {
    pub fn is_quoted(&self) -> bool {
        self.kind == TokenKind::Quoted
    }
}

/// Parse a complete quoted literal.
fn quoted_literal(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        char('\''),
        many0_count(alt((
            tag("''"),
            recognize(pair(char('\\'), anychar)),
            is_not("'\\"),
        ))),
        char('\''),
    )))(input)
}

/// Parse a run of raw SQL up to the next quote.
fn sql_run(input: &str) -> IResult<&str, &str> {
    take_till1(|c| c == '\'')(input)
}

fn token(input: &str) -> IResult<&str, (TokenKind, &str)> {
    alt((
        map(quoted_literal, |s| (TokenKind::Quoted, s)),
        map(sql_run, |s| (TokenKind::Sql, s)),
    ))(input)
}

/// Split SQL into quoted and raw runs.
///
/// An unterminated literal swallows the rest of the input as one quoted
/// token, so nothing after a stray quote is ever rewritten.
pub fn tokenize(sql: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut rest = sql;

    while !rest.is_empty() {
        let offset = sql.len() - rest.len();
        match token(rest) {
            Ok((remaining, (kind, text))) => {
                tokens.push(Token { kind, text, offset });
                rest = remaining;
            }
            Err(_) => {
                tokens.push(Token {
                    kind: TokenKind::Quoted,
                    text: rest,
                    offset,
                });
                break;
            }
        }
    }

    tokens
}

/// Rebuild SQL by rewriting raw runs only.
pub fn map_sql_runs(sql: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(sql.len());
    for token in tokenize(sql) {
        match token.kind {
            TokenKind::Quoted => out.push_str(token.text),
            TokenKind::Sql => out.push_str(&f(token.text)),
        }
    }
    out
}

/// Rebuild SQL by rewriting quoted literals only.
pub fn map_quoted_runs(sql: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(sql.len());
    for token in tokenize(sql) {
        match token.kind {
            TokenKind::Quoted => out.push_str(&f(token.text)),
            TokenKind::Sql => out.push_str(token.text),
        }
    }
    out
}

/// Re-encode one literal for a backend without backslash escapes.
///
/// `\'` becomes `''` and `\\` becomes `\`; the bytes of the value do not
/// change. Any other backslash pair is left alone.
pub fn standard_literal(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek().copied()) {
            ('\\', Some('\'')) => {
                chars.next();
                out.push_str("''");
            }
            ('\\', Some('\\')) => {
                chars.next();
                out.push('\\');
            }
            ('\\', Some(next)) => {
                chars.next();
                out.push('\\');
                out.push(next);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Replace literal contents with same-length filler.
///
/// Byte offsets in the masked text match the input, so positions found by
/// scanning the mask can slice the original.
pub fn mask_quoted(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for token in tokenize(sql) {
        match token.kind {
            TokenKind::Sql => out.push_str(token.text),
            TokenKind::Quoted => {
                let len = token.text.len();
                let closed = len >= 2 && token.text.ends_with('\'') && quoted_literal(token.text).is_ok();
                out.push('\'');
                if closed {
                    out.push_str(&"x".repeat(len - 2));
                    out.push('\'');
                } else {
                    out.push_str(&"x".repeat(len - 1));
                }
            }
        }
    }
    out
}

/// Split on `;` outside literals, dropping empty statements.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for token in tokenize(sql) {
        if token.is_quoted() {
            current.push_str(token.text);
            continue;
        }
        let mut parts = token.text.split(';');
        if let Some(first) = parts.next() {
            current.push_str(first);
        }
        for part in parts {
            let stmt = current.trim();
            if !stmt.is_empty() {
                statements.push(stmt.to_string());
            }
            current.clear();
            current.push_str(part);
        }
    }

    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Match `words` (separated by any whitespace) at `pos`, case-insensitively.
/// Returns the end offset of the match.
fn match_words(s: &str, pos: usize, words: &[&str]) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = pos;
    for (n, word) in words.iter().enumerate() {
        if n > 0 {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i == start {
                return None;
            }
        }
        let end = i + word.len();
        if end > bytes.len() || !s[i..end].eq_ignore_ascii_case(word) {
            return None;
        }
        i = end;
    }
    if i < bytes.len() && is_word_byte(bytes[i]) {
        return None;
    }
    Some(i)
}

/// Find a keyword at paren depth zero, outside literals, starting at `from`.
///
/// `masked` must come from [`mask_quoted`]. Multi-word keywords such as
/// `GROUP BY` match any whitespace between words. Returns `(start, end)`.
pub fn find_top_level_keyword(masked: &str, keyword: &str, from: usize) -> Option<(usize, usize)> {
    let words: Vec<&str> = keyword.split_whitespace().collect();
    let bytes = masked.as_bytes();
    let mut depth = 0i32;
    let mut in_quote = false;

    for i in 0..bytes.len() {
        let b = bytes[i];
        if b == b'\'' {
            in_quote = !in_quote;
            continue;
        }
        if in_quote {
            continue;
        }
        match b {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if i >= from && depth == 0 => {
                if i > 0 && is_word_byte(bytes[i - 1]) {
                    continue;
                }
                if let Some(end) = match_words(masked, i, &words) {
                    return Some((i, end));
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on `sep` at paren depth zero and outside literals.
pub fn split_top_level(sql: &str, sep: char) -> Vec<&str> {
    let masked = mask_quoted(sql);
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut start = 0;

    for (i, c) in masked.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            _ if in_quote => {}
            '(' => depth += 1,
            ')' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&sql[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&sql[start..]);
    parts
}

/// Offset of the `)` matching the `(` at `open`, ignoring literals.
pub fn matching_paren(masked: &str, open: usize) -> Option<usize> {
    let bytes = masked.as_bytes();
    if bytes.get(open) != Some(&b'(') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_quote = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'\'' => in_quote = !in_quote,
            _ if in_quote => {}
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove one pair of surrounding quotes and undo `''`, `\'` and `\\` escaping.
pub fn unquote(literal: &str) -> String {
    let inner = literal
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(literal);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                out.push('\'');
            }
            '\\' if matches!(chars.peek(), Some('\'' | '\\')) => {
                out.extend(chars.next());
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tokenize_runs() {
        let tokens = tokenize("SELECT 'a''b' , x FROM t WHERE y = 'c\\'d'");
        let kinds: Vec<_> = tokens.iter().map(|t| (t.kind, t.text)).collect();
        assert_eq!(
            kinds,
            vec![
                (TokenKind::Sql, "SELECT "),
                (TokenKind::Quoted, "'a''b'"),
                (TokenKind::Sql, " , x FROM t WHERE y = "),
                (TokenKind::Quoted, "'c\\'d'"),
            ]
        );
        assert_eq!(tokens[2].offset, 13);
    }

    #[test]
    fn test_tokenize_empty_literal() {
        let tokens = tokenize("''''");
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].is_quoted());
    }

    #[test]
    fn test_tokenize_unterminated() {
        let tokens = tokenize("SELECT 'abc TRUE");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].text, "'abc TRUE");
        assert!(tokens[1].is_quoted());
    }

    #[test]
    fn test_map_sql_runs_skips_literals() {
        let out = map_sql_runs("x = TRUE AND y = 'TRUE'", |s| s.replace("TRUE", "1"));
        assert_eq!(out, "x = 1 AND y = 'TRUE'");
    }

    #[test]
    fn test_mask_quoted_preserves_offsets() {
        let sql = "a = 'é;(x' AND b";
        let masked = mask_quoted(sql);
        assert_eq!(masked.len(), sql.len());
        assert!(!masked.contains(';'));
        assert!(masked.ends_with(" AND b"));
    }

    #[test]
    fn test_split_statements() {
        let stmts = split_statements("INSERT INTO t VALUES ('a;b'); SELECT 1;; ");
        assert_eq!(stmts, vec!["INSERT INTO t VALUES ('a;b')", "SELECT 1"]);
    }

    #[test]
    fn test_find_top_level_keyword() {
        let sql = "SELECT (SELECT x FROM y) FROM t GROUP\n BY a";
        let masked = mask_quoted(sql);
        let (start, _) = find_top_level_keyword(&masked, "FROM", 0).unwrap();
        assert_eq!(&sql[start..start + 6], "FROM t");
        let (g, end) = find_top_level_keyword(&masked, "GROUP BY", 0).unwrap();
        assert_eq!(&sql[g..end], "GROUP\n BY");
        assert!(find_top_level_keyword(&masked, "WHERE", 0).is_none());
    }

    #[test]
    fn test_keyword_inside_literal_ignored() {
        let sql = "SELECT 'FROM' AS f";
        assert!(find_top_level_keyword(&mask_quoted(sql), "FROM", 0).is_none());
    }

    #[test]
    fn test_split_top_level() {
        let parts = split_top_level("a, f(b, c), 'd,e'", ',');
        assert_eq!(parts, vec!["a", " f(b, c)", " 'd,e'"]);
    }

    #[test]
    fn test_matching_paren() {
        let sql = "f(a, (b), ')') + 1";
        assert_eq!(matching_paren(&mask_quoted(sql), 1), Some(13));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("'it''s'"), "it's");
        assert_eq!(unquote("'it\\'s'"), "it's");
        assert_eq!(unquote("'C:\\\\'"), "C:\\");
    }

    #[test]
    fn test_trailing_backslash_closes_nothing() {
        let tokens = tokenize("VALUES ('C:\\\\', 'TRUE')");
        let quoted: Vec<&str> = tokens.iter().filter(|t| t.is_quoted()).map(|t| t.text).collect();
        assert_eq!(quoted, vec!["'C:\\\\'", "'TRUE'"]);
    }

    #[test]
    fn test_standard_literal() {
        assert_eq!(standard_literal("'it\\'s'"), "'it''s'");
        assert_eq!(standard_literal("'C:\\\\'"), "'C:\\'");
        assert_eq!(standard_literal("'a\\nb'"), "'a\\nb'");
        assert_eq!(standard_literal("'it''s'"), "'it''s'");
        let out = map_quoted_runs("SELECT 'x\\'y' AS \\z", standard_literal);
        assert_eq!(out, "SELECT 'x''y' AS \\z");
    }
}
