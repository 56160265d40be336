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

//! Renders log lines and writes them out

use chrono::{DateTime, Local, TimeZone, Utc};
use http::{HeaderMap, HeaderName};
use once_cell::unsync::OnceCell;
use percent_encoding::percent_decode;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::fs::File;
use std::io::{stderr, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use crate::error::Error;
use crate::exchange::{Env, SharedWriter};
use crate::program::{Operation, Program, Special, TimeScale};

const LOG_BUF_INIT_SIZE: usize = 128;

type Evaluator = dyn Fn(&Env) -> Option<String> + Send + Sync;

/// Named callbacks that `$e{name}` directives refer to
#[derive(Clone, Default)]
pub struct Evaluators {
    callbacks: HashMap<String, Arc<Evaluator>>,
}

impl Debug for Evaluators {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.callbacks.keys()).finish()
    }
}

impl Evaluators {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback under the given name. A callback returning `None` is logged as `-`.
    pub fn register<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(&Env) -> Option<String> + Send + Sync + 'static,
    {
        self.callbacks.insert(name.into(), Arc::new(callback));
    }

    /// Runs the named callback, `None` if there is no such callback or it failed
    pub fn evaluate(&self, name: &str, env: &Env) -> Option<String> {
        self.callbacks.get(name).and_then(|callback| callback(env))
    }
}

/// Everything known about a request/response exchange at the time of logging
#[derive(Debug, Clone)]
pub struct Exchange<'a> {
    /// Request attributes
    pub env: &'a Env,
    /// Response status, any value outside `0..=999` is logged as `-`
    pub status: i128,
    /// Response headers, only needed if the program references them
    pub headers: Option<&'a HeaderMap>,
    /// Number of response body bytes sent, `None` if unknown
    pub body_bytes_sent: Option<u64>,
    /// Time the request processing started
    pub start: Instant,
    /// Time the response completed
    pub end: Instant,
    /// Wall-clock time used for time directives
    pub now: SystemTime,
    /// Callbacks for `$e{name}` directives
    pub evaluators: Option<&'a Evaluators>,
}

impl<'a> Exchange<'a> {
    /// Creates an exchange that started and completed just now, with nothing sent yet
    pub fn new(env: &'a Env, status: i128) -> Self {
        let start = Instant::now();
        Self {
            env,
            status,
            headers: None,
            body_bytes_sent: Some(0),
            start,
            end: start,
            now: SystemTime::now(),
            evaluators: None,
        }
    }
}

/// Appends data to the buffer, replacing quotes, control characters and non-ASCII bytes by `\xHH`
/// escape sequences.
pub(crate) fn escape_into(buf: &mut Vec<u8>, data: impl AsRef<[u8]>) {
    fn needs_escape(byte: u8) -> bool {
        byte == b'\'' || byte == b'"' || byte < b' ' || byte >= 0x7f
    }

    for &byte in data.as_ref() {
        if needs_escape(byte) {
            let _ = write!(buf, "\\x{byte:02X}");
        } else {
            buf.push(byte);
        }
    }
}

fn write_field(buf: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(value) => escape_into(buf, value),
        None => buf.push(b'-'),
    }
}

fn write_header(buf: &mut Vec<u8>, headers: Option<&HeaderMap>, name: &HeaderName) {
    let mut values = headers.into_iter().flat_map(|h| h.get_all(name));
    let Some(first) = values.next() else {
        buf.push(b'-');
        return;
    };

    escape_into(buf, first);
    for value in values {
        escape_into(buf, b"\n");
        escape_into(buf, value);
    }
}

fn write_time<Tz>(buf: &mut Vec<u8>, time: DateTime<Tz>, pattern: &str)
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut formatted = String::new();
    if std::fmt::Write::write_fmt(&mut formatted, format_args!("{}", time.format(pattern))).is_ok()
        && !formatted.is_empty()
    {
        buf.extend_from_slice(formatted.as_bytes());
    } else {
        buf.push(b'-');
    }
}

fn write_seconds(buf: &mut Vec<u8>, time: Duration, scale: TimeScale) {
    let seconds = time.as_secs();
    if scale.precision() == 0 {
        let _ = write!(buf, "{seconds}");
    } else {
        let fraction = time.subsec_micros() / scale.divisor();
        let width = usize::from(scale.precision());
        let _ = write!(buf, "{seconds}.{fraction:0width$}");
    }
}

fn write_request_uri(buf: &mut Vec<u8>, env: &Env) {
    if let Some(uri) = env.get("REQUEST_URI") {
        escape_into(buf, uri);
        return;
    }

    if let Some(path) = env.get("PATH_INFO") {
        escape_into(buf, path);
    }
    if let Some(query) = env.get("QUERY_STRING").filter(|q| !q.is_empty()) {
        buf.push(b'?');
        escape_into(buf, query);
    }
}

fn write_special(buf: &mut Vec<u8>, special: Special, exchange: &Exchange<'_>) {
    let env = exchange.env;
    let _ = match special {
        Special::BodyBytesSent => match exchange.body_bytes_sent {
            Some(bytes) => write!(buf, "{bytes}"),
            None => write!(buf, "-"),
        },
        Special::ResponseLength => match exchange.body_bytes_sent {
            Some(bytes) if bytes > 0 => write!(buf, "{bytes}"),
            _ => write!(buf, "-"),
        },
        Special::Status => {
            let status = exchange.status;
            if (0..=999).contains(&status) {
                write!(buf, "{status:03}")
            } else {
                write!(buf, "-")
            }
        }
        Special::Request => {
            if let Some(method) = env.get("REQUEST_METHOD") {
                escape_into(buf, method);
            }
            buf.push(b' ');
            write_request_uri(buf, env);
            if let Some(version) = env.get("HTTP_VERSION") {
                buf.push(b' ');
                escape_into(buf, version);
            }
            Ok(())
        }
        Special::RequestUri => {
            write_request_uri(buf, env);
            Ok(())
        }
        Special::RequestLength => match env.input_len() {
            Some(len) => write!(buf, "{len}"),
            None => write!(buf, "-"),
        },
        Special::Ip => {
            let addr = env
                .get("HTTP_X_FORWARDED_FOR")
                .filter(|addr| !addr.is_empty())
                .or_else(|| env.get("REMOTE_ADDR"));
            write_field(buf, addr);
            Ok(())
        }
        Special::Pid => write!(buf, "{}", std::process::id()),
        Special::TimeIso8601 => {
            let time = DateTime::<Local>::from(exchange.now);
            write!(buf, "{}", time.format("%Y-%m-%dT%H:%M:%S%:z"))
        }
    };
}

fn parse_cookies(header: &[u8]) -> Option<HashMap<String, Vec<u8>>> {
    let mut cookies = HashMap::new();
    for pair in header.split(|&b| b == b';' || b == b',') {
        let start = pair.iter().position(|&b| b != b' ').unwrap_or(pair.len());
        let pair = &pair[start..];
        let Some(separator) = pair.iter().position(|&b| b == b'=') else {
            continue;
        };

        let name = percent_decode(&pair[..separator]).decode_utf8().ok()?;
        let value = percent_decode(&pair[separator + 1..]).collect();
        cookies.entry(name.into_owned()).or_insert(value);
    }
    Some(cookies)
}

impl Program {
    /// Renders the log line for an exchange.
    pub fn render(&self, exchange: &Exchange<'_>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LOG_BUF_INIT_SIZE);
        self.render_into(&mut buf, exchange);
        buf
    }

    /// Renders the log line for an exchange, appending it to the buffer.
    pub fn render_into(&self, buf: &mut Vec<u8>, exchange: &Exchange<'_>) {
        let cookies = OnceCell::new();

        for operation in self.operations() {
            match operation {
                Operation::Literal(literal) => buf.extend_from_slice(literal.as_bytes()),
                Operation::RequestField(key) => write_field(buf, exchange.env.get(key)),
                Operation::ResponseField(name) => write_header(buf, exchange.headers, name),
                Operation::EvalExpr(name) => {
                    match exchange
                        .evaluators
                        .and_then(|evaluators| evaluators.evaluate(name, exchange.env))
                    {
                        Some(value) => buf.extend_from_slice(value.as_bytes()),
                        None => buf.push(b'-'),
                    }
                }
                Operation::Cookie(name) => {
                    let cookies = cookies.get_or_init(|| {
                        exchange.env.get("HTTP_COOKIE").and_then(parse_cookies)
                    });
                    let value = cookies
                        .as_ref()
                        .and_then(|cookies| cookies.get(name))
                        .map(Vec::as_slice);
                    write_field(buf, value);
                }
                Operation::Special(special) => write_special(buf, *special, exchange),
                Operation::TimeLocal { pattern, .. } => {
                    write_time(buf, DateTime::<Local>::from(exchange.now), pattern)
                }
                Operation::TimeUtc { pattern, .. } => {
                    write_time(buf, DateTime::<Utc>::from(exchange.now), pattern)
                }
                Operation::ElapsedTime(scale) => write_seconds(
                    buf,
                    exchange.end.saturating_duration_since(exchange.start),
                    *scale,
                ),
                Operation::WallTime(scale) => write_seconds(
                    buf,
                    exchange
                        .now
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .unwrap_or_default(),
                    *scale,
                ),
            }
        }
    }
}

/// Destination of the rendered log lines
#[derive(Clone)]
pub(crate) enum Sink {
    /// A configured log handle or file
    Writer(SharedWriter),
    /// The diagnostic stream of the request, standard error if there is none
    Fallback,
}

impl Debug for Sink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Writer(_) => f.write_str("Writer"),
            Self::Fallback => f.write_str("Fallback"),
        }
    }
}

fn write_to(writer: &SharedWriter, line: &[u8]) -> std::io::Result<()> {
    let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
    writer.write_all(line)?;
    writer.flush()
}

impl Sink {
    pub(crate) fn open(path: &Path) -> Result<Self, Error> {
        let file = File::options()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|source| Error::OpenLog {
                path: path.to_owned(),
                source,
            })?;
        Ok(Self::Writer(Arc::new(Mutex::new(file))))
    }

    /// Hands the line over to the destination in a single write.
    pub(crate) fn write(&self, env: &Env, line: &[u8]) -> Result<(), Error> {
        let result = match self {
            Self::Writer(writer) => write_to(writer, line),
            Self::Fallback => match env.errors() {
                Some(errors) => write_to(errors, line),
                None => {
                    let mut stderr = stderr().lock();
                    stderr.write_all(line).and_then(|_| stderr.flush())
                }
            },
        };
        result.map_err(Error::Write)
    }
}
