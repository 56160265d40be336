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

//! Compiled log formats

use http::HeaderName;
use log::{debug, trace};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::FormatError;
use crate::resolver::resolve;
use crate::scanner::scan;

/// Values with dedicated rendering logic, referenced by their name in the log format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    /// Number of response body bytes sent, `0` if nothing was sent
    BodyBytesSent,
    /// Three-digit response status
    Status,
    /// Request line like `GET /path?query HTTP/1.1`
    Request,
    /// Length of the request payload
    RequestLength,
    /// Like `BodyBytesSent` but `-` if nothing was sent
    ResponseLength,
    /// Client address, preferring `X-Forwarded-For`
    Ip,
    /// Process ID
    Pid,
    /// Request URI like `/path?query`
    RequestUri,
    /// Current time in ISO 8601 format
    TimeIso8601,
}

impl Special {
    /// Looks up a special value by its name in the log format
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "body_bytes_sent" => Self::BodyBytesSent,
            "status" => Self::Status,
            "request" => Self::Request,
            "request_length" => Self::RequestLength,
            "response_length" => Self::ResponseLength,
            "ip" => Self::Ip,
            "pid" => Self::Pid,
            "request_uri" => Self::RequestUri,
            "time_iso8601" => Self::TimeIso8601,
            _ => return None,
        })
    }
}

/// Fixed-point precision of a time value, from whole seconds to microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeScale {
    precision: u8,
}

impl TimeScale {
    /// Maximal number of fractional digits
    pub const MAX_PRECISION: u8 = 6;

    /// Creates a time scale with the given number of fractional digits, `None` if the precision
    /// exceeds [`TimeScale::MAX_PRECISION`].
    pub fn new(precision: u64) -> Option<Self> {
        let precision = u8::try_from(precision).ok()?;
        if precision <= Self::MAX_PRECISION {
            Some(Self { precision })
        } else {
            None
        }
    }

    /// Number of fractional digits
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Number microseconds are divided by to get the fractional part, 1 if there is none
    pub fn divisor(&self) -> u32 {
        if self.precision == 0 {
            1
        } else {
            10u32.pow(u32::from(Self::MAX_PRECISION - self.precision))
        }
    }
}

/// A single compiled log format instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Verbatim text
    Literal(String),
    /// Request attribute with the exact name given
    RequestField(String),
    /// Response header
    ResponseField(HeaderName),
    /// Named callback registered with the handler
    EvalExpr(String),
    /// Request cookie
    Cookie(String),
    /// A value with dedicated rendering logic
    Special(Special),
    /// Current local time formatted with a strftime-like pattern
    TimeLocal {
        /// Format pattern
        pattern: String,
        /// Output length for a reference time
        sample_width: usize,
    },
    /// Current UTC time formatted with a strftime-like pattern
    TimeUtc {
        /// Format pattern
        pattern: String,
        /// Output length for a reference time
        sample_width: usize,
    },
    /// Seconds since the request started
    ElapsedTime(TimeScale),
    /// Seconds since the Unix epoch
    WallTime(TimeScale),
}

/// A compiled log format
///
/// Programs are immutable and can be rendered for any number of requests concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    operations: Vec<Operation>,
    needs_response_headers: bool,
    needs_deferred_completion: bool,
}

static CACHE: Lazy<Mutex<HashMap<(String, String), Arc<Program>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl Program {
    /// Compiles a log format, making sure that each line ends with the output record separator
    /// `ors` unless it is empty.
    pub fn compile(format: &str, ors: &str) -> Result<Self, FormatError> {
        fn push_literal(operations: &mut Vec<Operation>, literal: &str) {
            if !literal.is_empty() {
                operations.push(Operation::Literal(literal.to_owned()));
            }
        }

        let mut operations = Vec::new();
        for segment in scan(format) {
            push_literal(&mut operations, segment.prefix);
            if let Some(token) = segment.token {
                operations.extend(resolve(token)?);
            }
            push_literal(&mut operations, segment.suffix);
        }

        if !ors.is_empty() {
            match operations.last() {
                Some(Operation::Literal(last)) if last.ends_with(ors) => {}
                _ => operations.push(Operation::Literal(ors.to_owned())),
            }
        }

        let needs_response_headers = operations
            .iter()
            .any(|op| matches!(op, Operation::ResponseField(_)));
        let needs_deferred_completion = operations.iter().any(|op| {
            matches!(
                op,
                Operation::ElapsedTime(_)
                    | Operation::Special(Special::BodyBytesSent | Special::ResponseLength)
            )
        });

        debug!(
            "Compiled log format {format:?} into {} operations \
            (response headers: {needs_response_headers}, deferred: {needs_deferred_completion})",
            operations.len()
        );

        Ok(Self {
            operations,
            needs_response_headers,
            needs_deferred_completion,
        })
    }

    /// Compiles a log format, reusing the result of any previous compilation of the same format
    /// and output record separator.
    pub fn compile_cached(format: &str, ors: &str) -> Result<Arc<Self>, FormatError> {
        let key = (format.to_owned(), ors.to_owned());
        let mut cache = CACHE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(program) = cache.get(&key) {
            trace!("Using cached program for log format {format:?}");
            return Ok(program.clone());
        }

        let program = Arc::new(Self::compile(format, ors)?);
        cache.insert(key, program.clone());
        Ok(program)
    }

    /// The compiled operations in output order
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Checks whether rendering requires response headers
    pub fn needs_response_headers(&self) -> bool {
        self.needs_response_headers
    }

    /// Checks whether rendering has to wait for the response body to complete
    pub fn needs_deferred_completion(&self) -> bool {
        self.needs_deferred_completion
    }
}
