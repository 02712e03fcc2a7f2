//! Lexical screening of expressions before they reach the engine.
//!
//! The workflow expression language is a single ES expression; assignment,
//! statements, loops, `new`, `eval`, and engine escape hatches are rejected
//! here with byte positions, so a forbidden construct never executes even
//! though the underlying engine would accept it.

use super::{ErrorKind, EvaluationError};

/// Words that must not appear anywhere in an expression. Statement
/// keywords, constructors, and sandbox escape hatches.
const FORBIDDEN_WORDS: &[&str] = &[
    "new",
    "eval",
    "Function",
    "globalThis",
    "Reflect",
    "Proxy",
    "while",
    "for",
    "do",
    "var",
    "let",
    "const",
    "class",
    "function",
    "return",
    "throw",
    "delete",
    "import",
    "yield",
    "await",
    "with",
];

// ---------------------------------------------------------------------------
// Forbidden-construct check
// ---------------------------------------------------------------------------

/// Reject forbidden constructs. String literals are skipped; everything
/// else is scanned token-wise.
pub(super) fn check(source: &str) -> Result<(), EvaluationError> {
    let bytes = source.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        // Skip string literals wholesale
        if c == b'\'' || c == b'"' {
            i = skip_string(source, i)?;
            continue;
        }

        if c == b'`' {
            return Err(forbidden(i, "template literals are not supported"));
        }
        if c == b';' {
            return Err(forbidden(i, "statements are not allowed in expressions"));
        }

        // Identifier words
        if c.is_ascii_alphabetic() || c == b'_' || c == b'$' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
            {
                i += 1;
            }
            let word = &source[start..i];
            if FORBIDDEN_WORDS.contains(&word) {
                return Err(forbidden(start, format!("'{word}' is not allowed")));
            }
            continue;
        }

        // Increment/decrement are property writes
        if (c == b'+' && bytes.get(i + 1) == Some(&b'+'))
            || (c == b'-' && bytes.get(i + 1) == Some(&b'-'))
        {
            return Err(forbidden(i, "increment/decrement is not allowed"));
        }

        // Assignment: a bare `=` that is not part of ==, !=, <=, >=, =>,
        // and compound assignments like `+=` or `<<=`.
        if c == b'=' {
            let prev = i.checked_sub(1).map(|p| bytes[p]);
            let prev2 = i.checked_sub(2).map(|p| bytes[p]);
            let next = bytes.get(i + 1).copied();

            let comparison = matches!(prev, Some(b'=' | b'!'))
                || matches!(next, Some(b'=' | b'>'))
                || (matches!(prev, Some(b'<' | b'>')) && !matches!(prev2, Some(b'<' | b'>')));
            let compound = matches!(
                prev,
                Some(b'+' | b'-' | b'*' | b'/' | b'%' | b'&' | b'|' | b'^')
            ) || (matches!(prev, Some(b'<' | b'>')) && matches!(prev2, Some(b'<' | b'>')));

            if compound || !comparison {
                return Err(forbidden(i, "assignment is not allowed in expressions"));
            }
        }

        i += 1;
    }

    Ok(())
}

fn forbidden(position: usize, message: impl Into<String>) -> EvaluationError {
    EvaluationError::new(ErrorKind::ForbiddenConstruct, position, message)
}

/// Skip a quoted string starting at `start`; returns the index past the
/// closing quote.
fn skip_string(source: &str, start: usize) -> Result<usize, EvaluationError> {
    let bytes = source.as_bytes();
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            c if c == quote => return Ok(i + 1),
            _ => i += 1,
        }
    }
    // Unterminated: let the engine produce the syntax error
    Ok(bytes.len())
}

// ---------------------------------------------------------------------------
// Pure-lookup classification
// ---------------------------------------------------------------------------

/// True when the expression is only identifier/member/index chains with
/// literal indexes -- i.e. a plain variable lookup.
pub(super) fn is_pure_lookup(source: &str) -> bool {
    let bytes = source.trim().as_bytes();
    let mut i = match eat_identifier(bytes, 0) {
        Some(next) => next,
        None => return false,
    };

    while i < bytes.len() {
        match bytes[i] {
            b'.' => match eat_identifier(bytes, i + 1) {
                Some(next) => i = next,
                None => return false,
            },
            b'[' => match eat_literal_index(bytes, i + 1) {
                Some(next) => i = next,
                None => return false,
            },
            _ => return false,
        }
    }
    true
}

/// Consume an identifier at `start`; returns the index past it.
fn eat_identifier(bytes: &[u8], start: usize) -> Option<usize> {
    let first = *bytes.get(start)?;
    if !(first.is_ascii_alphabetic() || first == b'_' || first == b'$') {
        return None;
    }
    let mut i = start + 1;
    while i < bytes.len()
        && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
    {
        i += 1;
    }
    Some(i)
}

/// Consume a literal index (`123]` or `'key']` / `"key"]`); returns the
/// index past the closing bracket.
fn eat_literal_index(bytes: &[u8], start: usize) -> Option<usize> {
    let first = *bytes.get(start)?;
    let mut i = start;
    if first.is_ascii_digit() {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    } else if first == b'\'' || first == b'"' {
        i += 1;
        while i < bytes.len() && bytes[i] != first {
            i += 1;
        }
        if i >= bytes.len() {
            return None;
        }
        i += 1;
    } else {
        return None;
    }
    if bytes.get(i) == Some(&b']') {
        Some(i + 1)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
