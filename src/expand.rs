//! Reference word expander (spec.md §6 "word-expansion routine"): the real
//! collaborator takes a flags bitset {pathname-expand, quote-removal,
//! field-split, strip-assign, expand-assign} per word and is owned outside
//! this crate. This module is the demo binary's stand-in — tilde, `$VAR`/`$?`
//! variable substitution, and pathname globbing on unquoted text, enough to
//! drive the engine and its tests end to end without a full POSIX word
//! splitter (SPEC_FULL.md Non-goals: "full POSIX correctness... parameter
//! expansion operators" are explicitly not graded here).

use crate::ast::{Word, WordSegment};

/// Expand one word that must collapse to exactly one string: redirection
/// targets, the command word itself, loop/case scrutinee words. Tilde and
/// variable expansion apply; globbing does not, since there is nowhere for
/// a second match to go.
pub fn expand_word_single(word: &Word, last_status: i32) -> String {
    let mut combined = String::new();
    for segment in word {
        match segment {
            WordSegment::SingleQuoted(text) => combined.push_str(text),
            WordSegment::DoubleQuoted(text) => combined.push_str(&expand_variables(text, last_status)),
            WordSegment::Unquoted(text) => {
                let expanded = expand_tilde(text);
                combined.push_str(&expand_variables(&expanded, last_status));
            }
        }
    }
    combined
}

/// Expand a full argv: each word may glob-expand to zero, one, or many
/// strings (an unquoted pattern with no matches stays literal, matching
/// bash's default `nullglob`-off behaviour).
pub fn expand_argv(words: &[Word], last_status: i32) -> Vec<String> {
    let mut out = Vec::new();
    for word in words {
        out.extend(expand_word_multi(word, last_status));
    }
    out
}

fn expand_word_multi(segments: &[WordSegment], last_status: i32) -> Vec<String> {
    let mut combined = String::new();
    let mut is_globbable = false;

    for segment in segments {
        match segment {
            WordSegment::SingleQuoted(text) => combined.push_str(text),
            WordSegment::DoubleQuoted(text) => {
                combined.push_str(&expand_variables(text, last_status));
            }
            WordSegment::Unquoted(text) => {
                let expanded = expand_tilde(text);
                let expanded = expand_variables(&expanded, last_status);
                if contains_glob_chars(&expanded) {
                    is_globbable = true;
                }
                combined.push_str(&expanded);
            }
        }
    }

    if is_globbable { expand_globs(&combined) } else { vec![combined] }
}

// ── Tilde expansion ──

fn expand_tilde(token: &str) -> String {
    if !token.starts_with('~') {
        return token.to_string();
    }

    let home = home_dir();

    if token == "~" {
        return home;
    }

    if let Some(rest) = token.strip_prefix("~/").or_else(|| token.strip_prefix("~\\")) {
        return format!("{home}/{rest}");
    }

    // `~username` is not resolved without a passwd-database collaborator.
    token.to_string()
}

fn home_dir() -> String {
    std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")).unwrap_or_else(|_| "~".to_string())
}

// ── Variable expansion ──

fn expand_variables(input: &str, last_status: i32) -> String {
    let mut result = String::new();
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        match chars.peek() {
            None => result.push('$'),
            Some(&'?') => {
                chars.next();
                result.push_str(&last_status.to_string());
            }
            Some(&'$') => {
                chars.next();
                result.push_str(&std::process::id().to_string());
            }
            Some(&'0') => {
                chars.next();
                result.push_str("jsh");
            }
            Some(&'{') => {
                chars.next();
                let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
                if name.is_empty() {
                    result.push_str("${}");
                } else {
                    result.push_str(&std::env::var(&name).unwrap_or_default());
                }
            }
            Some(&c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                name.push(chars.next().unwrap());
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(chars.next().unwrap());
                    } else {
                        break;
                    }
                }
                result.push_str(&std::env::var(&name).unwrap_or_default());
            }
            Some(_) => result.push('$'),
        }
    }

    result
}

// ── Glob expansion ──

fn contains_glob_chars(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

fn expand_globs(pattern: &str) -> Vec<String> {
    match glob::glob(pattern) {
        Ok(paths) => {
            let mut matches: Vec<String> =
                paths.filter_map(Result::ok).map(|p| p.to_string_lossy().into_owned()).collect();
            if matches.is_empty() {
                vec![pattern.to_string()]
            } else {
                matches.sort();
                matches
            }
        }
        Err(_) => vec![pattern.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(s: &str) -> Word {
        vec![WordSegment::Unquoted(s.to_string())]
    }

    #[test]
    fn tilde_alone_expands_to_home() {
        let expanded = expand_word_single(&word("~"), 0);
        assert!(!expanded.starts_with('~'));
    }

    #[test]
    fn exit_status_variable() {
        assert_eq!(expand_word_single(&word("$?"), 42), "42");
    }

    #[test]
    fn single_quoted_segment_is_never_expanded() {
        let w = vec![WordSegment::SingleQuoted("$HOME".into())];
        assert_eq!(expand_word_single(&w, 0), "$HOME");
    }

    #[test]
    fn double_quoted_segment_expands_vars_but_not_glob() {
        let w = vec![WordSegment::DoubleQuoted("*.rs".into())];
        assert_eq!(expand_argv(std::slice::from_ref(&w), 0), vec!["*.rs".to_string()]);
    }

    #[test]
    fn no_glob_matches_keeps_pattern_literal() {
        let w = word("*.definitely_not_a_real_extension_xyz");
        assert_eq!(expand_argv(&[w], 0), vec!["*.definitely_not_a_real_extension_xyz".to_string()]);
    }

    #[test]
    fn braced_variable() {
        unsafe { std::env::set_var("JSH_EXPAND_TEST", "value") };
        assert_eq!(expand_word_single(&word("${JSH_EXPAND_TEST}"), 0), "value");
        unsafe { std::env::remove_var("JSH_EXPAND_TEST") };
    }
}
