// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Token substitution for node configuration templates.
//!
//! Tokens have the form `${key}`. A token whose key is not in the map is left in place, so that a
//! missing setting is visible in the rendered file. A backslash directly before `${` escapes the
//! token: `\${key}` renders as the literal text `${key}`.

use std::collections::BTreeMap;

/// Replace every `${key}` token in `text` with its value in `tokens`.
pub fn substitute(text: &str, tokens: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find("${") {
        let escaped = rest[..pos].ends_with('\\');
        if escaped {
            out.push_str(&rest[..pos - 1]);
        } else {
            out.push_str(&rest[..pos]);
        }
        let after = &rest[pos + 2..];

        let Some(end) = after.find('}') else {
            // Unterminated token.
            out.push_str(&rest[pos..]);
            return out;
        };

        let key = &after[..end];
        match tokens.get(key) {
            Some(value) if !escaped => out.push_str(value),
            _ => {
                out.push_str("${");
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Returns the keys of all unescaped tokens in `text` that `tokens` does not resolve.
pub fn unresolved(text: &str, tokens: &BTreeMap<String, String>) -> Vec<String> {
    let mut missing = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("${") {
        let escaped = rest[..pos].ends_with('\\');
        let after = &rest[pos + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        let key = &after[..end];
        if !escaped && !tokens.contains_key(key) {
            missing.push(key.to_string());
        }
        rest = &after[end + 1..];
    }
    missing
}
