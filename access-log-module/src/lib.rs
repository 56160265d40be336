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

//! # Access Log Module
//!
//! This crate writes one access log line per request/response exchange, formatted according to a
//! nginx-like format string. A configuration could look like this:
//!
//! ```yaml
//! log_file: access.log
//! log_format: "$ip - $remote_user [$time_local] \"$request\" $status $response_length"
//! ors: "\n"
//! reentrant: auto
//! ```
//!
//! The `log_file` and `log_format` fields are also available as `--log-file` and `--log-format`
//! command line options. Without a log file, each line goes to the diagnostic stream of the
//! request or to standard error. A log file will be created if necessary, data in already
//! existing files will be kept.
//!
//! Instead of a format string, `log_format` can name one of the presets: `common` (default),
//! `combined`, `nginx_combined` or `rack_1_0`.
//!
//! The supported directives are:
//!
//! * `$remote_addr`, `$request_method`, `$query_string` and other CGI variables: the request
//!   attribute with the upper-case name
//! * `$http_<header>`: value of an HTTP request header, e.g. `$http_user_agent`
//! * `$sent_http_<header>`: value of an HTTP response header, e.g. `$sent_http_content_type`
//! * `$cookie_<name>`: value of a request cookie
//! * `$env{key}`: request attribute with the exact name given
//! * `$e{name}`: result of a callback registered via [`Evaluators`]
//! * `$status`: three-digit response status
//! * `$request`: request line, e.g. `GET /index.html HTTP/1.1`
//! * `$request_uri`: request URI, e.g. `/index.html?query`
//! * `$request_length`: size of the request payload
//! * `$body_bytes_sent`: number of response body bytes sent
//! * `$response_length`: like `$body_bytes_sent` but `-` if nothing was sent
//! * `$ip`: client address, preferring the `X-Forwarded-For` header
//! * `$pid`: process ID
//! * `$request_time{N}`: seconds elapsed while processing the request with `N` fractional digits
//!   (at most 6), `$request_time` is the same as `$request_time{3}`
//! * `$time{N}`: seconds since the Unix epoch, `$msec` and `$usec` are aliases for `$time{3}` and
//!   `$time{6}`
//! * `$time_local{pattern}`, `$time_utc{pattern}`: current time formatted with a strftime-like
//!   pattern, without a pattern e.g. `10/Oct/2000:13:55:36 -0700`
//! * `$time_iso8601`: current time in the ISO 8601 format
//!
//! Unknown directives are rejected when the format is compiled. Any quotes, control characters
//! and non-ASCII bytes in values are written as `\xHH` escape sequences.
//!
//! If the log format refers to the number of bytes sent or the request duration, the line is only
//! written once the response body has been closed.
//!
//! ## Code example
//!
//! ```rust
//! use access_log_module::{
//!     AccessLogConf, AccessLogHandler, BoxError, ChunkedBody, Env, Response,
//! };
//! use std::sync::{Arc, Mutex};
//!
//! let conf = AccessLogConf::from_yaml("log_format: \"$remote_addr $status $body_bytes_sent\"")
//!     .unwrap();
//! let output = Arc::new(Mutex::new(Vec::<u8>::new()));
//! let handler = AccessLogHandler::with_logger(
//!     |_: &Env| Ok::<_, BoxError>(Response::new(200, ChunkedBody::new(["Hello world!"]))),
//!     conf,
//!     output.clone(),
//! )
//! .unwrap();
//!
//! let mut response = handler.call(Env::new().with("REMOTE_ADDR", "127.0.0.1")).unwrap();
//! while let Some(chunk) = response.body.next_chunk() {
//!     let _data = chunk.unwrap();
//!     // Send data to the client here
//! }
//! response.body.close().unwrap();
//!
//! assert_eq!(*output.lock().unwrap(), b"127.0.0.1 200 12\n");
//! ```

pub mod configuration;
mod error;
mod exchange;
mod handler;
mod program;
mod resolver;
mod scanner;
mod writer;

pub use configuration::{AccessLogConf, AccessLogOpt, LogFormat, Reentrancy};
pub use error::{BoxError, Error, FormatError};
pub use exchange::{
    Body, Capabilities, Capability, ChunkedBody, Env, FileBody, Response, SharedWriter,
};
pub use handler::{AccessLogHandler, Application, LoggedBody, Phase};
pub use program::{Operation, Program, Special, TimeScale};
pub use writer::{Evaluators, Exchange};
