// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Splits a log format into literal text and directive tokens

/// A directive token together with the literal text surrounding it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment<'a> {
    pub(crate) prefix: &'a str,
    pub(crate) token: Option<&'a str>,
    pub(crate) suffix: &'a str,
}

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn word_len(s: &str) -> usize {
    s.find(|c: char| !is_word(c)).unwrap_or(s.len())
}

fn literal_len(s: &str) -> usize {
    s.find('$').unwrap_or(s.len())
}

/// Matches `name{arg}` at the start of `s`, returns the length of the match if `arg` is accepted.
fn braced(s: &str, name: &str, accept: impl Fn(&str) -> bool) -> Option<usize> {
    let rest = s.strip_prefix(name)?.strip_prefix('{')?;
    let arg = &rest[..rest.find('}')?];
    if accept(arg) {
        Some(name.len() + arg.len() + 2)
    } else {
        None
    }
}

fn is_env_key(arg: &str) -> bool {
    let head = word_len(arg);
    let tail = &arg[head..];
    head > 0
        && (tail.is_empty()
            || (tail.len() > 1
                && tail.starts_with('.')
                && tail.chars().all(|c| is_word(c) || c == '.')))
}

fn is_digits(arg: &str) -> bool {
    !arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit())
}

fn is_pattern(arg: &str) -> bool {
    !arg.is_empty()
}

/// Length of the directive token at the start of `s`, which has to start with `$`.
fn token_len(s: &str) -> usize {
    let dollars = s.len() - s.trim_start_matches('$').len();
    let name = &s[dollars..];

    let len = braced(name, "env", is_env_key)
        .or_else(|| braced(name, "e", is_pattern))
        .or_else(|| braced(name, "time", is_digits))
        .or_else(|| braced(name, "request_time", is_digits))
        .or_else(|| braced(name, "time_utc", is_pattern))
        .or_else(|| braced(name, "time_local", is_pattern))
        .unwrap_or_else(|| word_len(name));
    dollars + len
}

/// Splits the format into segments covering the entire string.
pub(crate) fn scan(format: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = format;
    while !rest.is_empty() {
        let (prefix, remainder) = rest.split_at(literal_len(rest));
        let (token, remainder) = if remainder.is_empty() {
            (None, remainder)
        } else {
            let (token, remainder) = remainder.split_at(token_len(remainder));
            (Some(token), remainder)
        };
        let (suffix, remainder) = remainder.split_at(literal_len(remainder));
        segments.push(Segment {
            prefix,
            token,
            suffix,
        });
        rest = remainder;
    }
    segments
}
