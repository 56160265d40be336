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

//! Translates directive tokens into operations

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use http::HeaderName;
use std::fmt::Write;

use crate::error::FormatError;
use crate::program::{Operation, Special, TimeScale};

/// nginx variables that are less customizable than our own
const ALIASES: &[(&str, &str)] = &[
    ("$request_time", "$request_time{3}"),
    ("$time_local", "$time_local{%d/%b/%Y:%H:%M:%S %z}"),
    ("$time_utc", "$time_utc{%d/%b/%Y:%H:%M:%S +0000}"),
    ("$msec", "$time{3}"),
    ("$usec", "$time{6}"),
];

/// Request attributes without the `HTTP_` prefix that can be referenced by their lower-case name
const CGI_VARIABLES: &[&str] = &[
    "auth_type",
    "content_length",
    "content_type",
    "gateway_interface",
    "path_info",
    "path_translated",
    "query_string",
    "remote_addr",
    "remote_ident",
    "remote_user",
    "request_method",
    "script_name",
    "server_name",
    "server_port",
    "server_software",
];

fn braced_arg<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?
        .strip_prefix('{')?
        .strip_suffix('}')
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn time_scale(token: &str, arg: &str) -> Result<TimeScale, FormatError> {
    // Digits only, anything that doesn't fit into u64 is too high anyway
    let precision = arg.parse().unwrap_or(u64::MAX);
    TimeScale::new(precision).ok_or_else(|| FormatError::Precision {
        token: token.to_owned(),
        precision,
    })
}

fn reference_time() -> Option<DateTime<FixedOffset>> {
    // 10/Oct/2000:13:55:36 -0700
    let offset = FixedOffset::west_opt(7 * 3600)?;
    Some(
        Utc.timestamp_opt(971_211_336, 0)
            .single()?
            .with_timezone(&offset),
    )
}

/// Validates a time pattern by formatting the reference time, returns the resulting length.
fn sample_width(token: &str, pattern: &str) -> Result<usize, FormatError> {
    let error = || FormatError::TimePattern(token.to_owned());

    let items: Vec<_> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(error());
    }

    let time = reference_time().ok_or_else(error)?;
    let mut sample = String::new();
    write!(sample, "{}", time.format_with_items(items.iter())).map_err(|_| error())?;
    Ok(sample.len())
}

fn request_field(name: &str) -> Option<String> {
    if CGI_VARIABLES.contains(&name) {
        return Some(name.to_ascii_uppercase());
    }

    let header = name
        .strip_prefix("http_")
        .or_else(|| name.strip_prefix("HTTP_"))
        .and_then(non_empty)?;
    Some(format!("HTTP_{}", header.to_ascii_uppercase()))
}

/// Resolves a directive token produced by the scanner. Any `$` characters in excess of the first
/// one become a literal, so the result is either one or two operations.
pub(crate) fn resolve(token: &str) -> Result<Vec<Operation>, FormatError> {
    let mut operations = Vec::new();

    let dollars = token.len() - token.trim_start_matches('$').len();
    if dollars > 1 {
        operations.push(Operation::Literal("$".repeat(dollars - 1)));
    }
    let token = &token[dollars.saturating_sub(1)..];

    let token = ALIASES
        .iter()
        .find(|(alias, _)| *alias == token)
        .map_or(token, |&(_, replacement)| replacement);
    let name = token.strip_prefix('$').unwrap_or(token);

    let operation = if name.is_empty() {
        Operation::Literal(token.to_owned())
    } else if let Some(key) = braced_arg(name, "env") {
        Operation::RequestField(key.to_owned())
    } else if let Some(name) = braced_arg(name, "e") {
        Operation::EvalExpr(name.to_owned())
    } else if let Some(name) = name.strip_prefix("cookie_").and_then(non_empty) {
        Operation::Cookie(name.to_owned())
    } else if let Some(key) = request_field(name) {
        Operation::RequestField(key)
    } else if let Some(header) = name.strip_prefix("sent_http_").and_then(non_empty) {
        let header = header.to_ascii_lowercase().replace('_', "-");
        Operation::ResponseField(
            HeaderName::try_from(header)
                .map_err(|_| FormatError::HeaderName(token.to_owned()))?,
        )
    } else if let Some(pattern) = braced_arg(name, "time_local") {
        Operation::TimeLocal {
            pattern: pattern.to_owned(),
            sample_width: sample_width(token, pattern)?,
        }
    } else if let Some(pattern) = braced_arg(name, "time_utc") {
        Operation::TimeUtc {
            pattern: pattern.to_owned(),
            sample_width: sample_width(token, pattern)?,
        }
    } else if let Some(arg) = braced_arg(name, "time") {
        Operation::WallTime(time_scale(token, arg)?)
    } else if let Some(arg) = braced_arg(name, "request_time") {
        Operation::ElapsedTime(time_scale(token, arg)?)
    } else if let Some(special) = Special::from_name(name) {
        Operation::Special(special)
    } else {
        return Err(FormatError::UnknownDirective(token.to_owned()));
    };

    operations.push(operation);
    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::header;
    use test_log::test;

    fn resolve_one(token: &str) -> Operation {
        let mut operations = resolve(token).unwrap();
        assert_eq!(operations.len(), 1, "{token}");
        operations.remove(0)
    }

    fn request(s: &str) -> Operation {
        Operation::RequestField(s.to_owned())
    }

    #[test]
    fn request_fields() {
        assert_eq!(resolve_one("$remote_addr"), request("REMOTE_ADDR"));
        assert_eq!(resolve_one("$request_method"), request("REQUEST_METHOD"));
        assert_eq!(resolve_one("$server_software"), request("SERVER_SOFTWARE"));
        assert_eq!(resolve_one("$content_length"), request("CONTENT_LENGTH"));
        assert_eq!(resolve_one("$http_user_agent"), request("HTTP_USER_AGENT"));
        assert_eq!(resolve_one("$HTTP_HOST"), request("HTTP_HOST"));
        assert_eq!(resolve_one("$http_content_type"), request("HTTP_CONTENT_TYPE"));
        assert_eq!(resolve_one("$content_type"), request("CONTENT_TYPE"));
        assert_eq!(resolve_one("$env{rack.url_scheme}"), request("rack.url_scheme"));
        assert_eq!(resolve_one("$env{FOO}"), request("FOO"));
        assert!(resolve("$REMOTE_ADDR").is_err());
        assert!(resolve("$http_").is_err());
    }

    #[test]
    fn response_fields() {
        assert_eq!(
            resolve_one("$sent_http_content_type"),
            Operation::ResponseField(header::CONTENT_TYPE)
        );
        assert_eq!(
            resolve_one("$sent_http_Set_Cookie"),
            Operation::ResponseField(header::SET_COOKIE)
        );
    }

    #[test]
    fn callbacks_and_cookies() {
        assert_eq!(
            resolve_one("$e{Thread.current}"),
            Operation::EvalExpr("Thread.current".to_owned())
        );
        assert_eq!(
            resolve_one("$cookie_foo"),
            Operation::Cookie("foo".to_owned())
        );
        assert!(resolve("$cookie_").is_err());
    }

    #[test]
    fn aliases() {
        assert_eq!(
            resolve_one("$request_time"),
            Operation::ElapsedTime(TimeScale::new(3).unwrap())
        );
        assert_eq!(
            resolve_one("$msec"),
            Operation::WallTime(TimeScale::new(3).unwrap())
        );
        assert_eq!(
            resolve_one("$usec"),
            Operation::WallTime(TimeScale::new(6).unwrap())
        );
        assert_eq!(
            resolve_one("$time_local"),
            Operation::TimeLocal {
                pattern: "%d/%b/%Y:%H:%M:%S %z".to_owned(),
                sample_width: 26,
            }
        );
        assert_eq!(
            resolve_one("$time_utc"),
            Operation::TimeUtc {
                pattern: "%d/%b/%Y:%H:%M:%S +0000".to_owned(),
                sample_width: 26,
            }
        );
    }

    #[test]
    fn time_patterns() {
        assert_eq!(
            resolve_one("$time_local{%d/%b/%Y %H:%M:%S}"),
            Operation::TimeLocal {
                pattern: "%d/%b/%Y %H:%M:%S".to_owned(),
                sample_width: 20,
            }
        );
        assert_eq!(
            resolve_one("$time_utc{%Y}"),
            Operation::TimeUtc {
                pattern: "%Y".to_owned(),
                sample_width: 4,
            }
        );
        assert_eq!(
            resolve("$time_utc{%Q}"),
            Err(FormatError::TimePattern("$time_utc{%Q}".to_owned()))
        );
    }

    #[test]
    fn precision() {
        assert_eq!(
            resolve_one("$time{0}"),
            Operation::WallTime(TimeScale::new(0).unwrap())
        );
        assert_eq!(
            resolve_one("$request_time{6}"),
            Operation::ElapsedTime(TimeScale::new(6).unwrap())
        );
        assert_eq!(
            resolve("$request_time{7}"),
            Err(FormatError::Precision {
                token: "$request_time{7}".to_owned(),
                precision: 7,
            })
        );
        assert!(matches!(
            resolve("$time{99999999999999999999999}"),
            Err(FormatError::Precision { .. })
        ));
    }

    #[test]
    fn specials() {
        for (token, special) in [
            ("$body_bytes_sent", Special::BodyBytesSent),
            ("$status", Special::Status),
            ("$request", Special::Request),
            ("$request_length", Special::RequestLength),
            ("$response_length", Special::ResponseLength),
            ("$ip", Special::Ip),
            ("$pid", Special::Pid),
            ("$request_uri", Special::RequestUri),
            ("$time_iso8601", Special::TimeIso8601),
        ] {
            assert_eq!(resolve_one(token), Operation::Special(special));
        }
        assert_eq!(
            resolve("$Status"),
            Err(FormatError::UnknownDirective("$Status".to_owned()))
        );
    }

    #[test]
    fn dollars() {
        assert_eq!(
            resolve("$$$$pid").unwrap(),
            vec![
                Operation::Literal("$$$".to_owned()),
                Operation::Special(Special::Pid)
            ]
        );
        assert_eq!(
            resolve("$$").unwrap(),
            vec![
                Operation::Literal("$".to_owned()),
                Operation::Literal("$".to_owned())
            ]
        );
        assert_eq!(
            resolve("$$$msec").unwrap(),
            vec![
                Operation::Literal("$$".to_owned()),
                Operation::WallTime(TimeScale::new(3).unwrap())
            ]
        );
        assert_eq!(
            resolve("$").unwrap(),
            vec![Operation::Literal("$".to_owned())]
        );
    }
}
