//! Bounded scanner for string fields in JSON documents
//!
//! The mesh topology endpoints and the olsrd jsoninfo plugin emit JSON
//! that this agent only needs a handful of string fields from. Rather
//! than build a document tree for multi-hundred-node meshes on a router
//! with a few megabytes of RAM, this scanner makes a single bounded pass
//! and emits `(key, value)` pairs.
//!
//! Supported grammar: JSON objects (arbitrarily held inside arrays or
//! other objects up to [`MAX_DEPTH`]) whose fields of interest are
//! strings. Non-string values are skipped. Inputs nesting deeper than
//! the bound are rejected rather than scanned blind.

use crate::{Error, Result};

/// Maximum brace/bracket nesting accepted.
pub const MAX_DEPTH: usize = 16;

/// Scan `input` and return up to `budget` `(key, value)` string pairs.
pub fn scan_string_fields(input: &str, budget: usize) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut depth: usize = 0;
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        match c {
            '{' | '[' => {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(Error::parse(format!(
                        "JSON nesting exceeds depth bound {}",
                        MAX_DEPTH
                    )));
                }
            }
            '}' | ']' => {
                depth = depth.saturating_sub(1);
            }
            '"' => {
                let text = read_string(&mut chars)?;
                // A string followed by ':' is a key; anything else is a
                // value and the main loop walks past it.
                skip_whitespace(&mut chars);
                if matches!(chars.peek(), Some((_, ':'))) {
                    chars.next();
                    skip_whitespace(&mut chars);
                    if matches!(chars.peek(), Some((_, '"'))) {
                        chars.next();
                        let value = read_string(&mut chars)?;
                        pairs.push((text, value));
                        if pairs.len() >= budget {
                            return Ok(pairs);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(pairs)
}

fn skip_whitespace(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) {
    while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
        chars.next();
    }
}

/// Read a JSON string body after the opening quote, handling escapes.
fn read_string(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> Result<String> {
    let mut out = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            '"' => return Ok(out),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, 'u')) => {
                    // Consume the four hex digits; the escaped code point is
                    // not needed by any consumer, so keep the raw form.
                    let mut hex = String::new();
                    for _ in 0..4 {
                        if let Some((_, h)) = chars.next() {
                            hex.push(h);
                        }
                    }
                    if let Ok(code) = u32::from_str_radix(&hex, 16) {
                        if let Some(ch) = char::from_u32(code) {
                            out.push(ch);
                        }
                    }
                }
                Some((_, other)) => out.push(other),
                None => return Err(Error::parse("unterminated escape in JSON string")),
            },
            _ => out.push(c),
        }
    }
    Err(Error::parse("unterminated JSON string"))
}
