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

//! Error types of the access log module

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error type used by applications wrapped with the access log handler
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors detected while compiling a log format
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// The directive is not known
    #[error("unable to make sense of token: {0}")]
    UnknownDirective(String),
    /// Time directive with more than six fractional digits
    #[error("{token}: too high precision: {precision} (max=6)")]
    Precision {
        /// The offending directive
        token: String,
        /// Requested number of fractional digits
        precision: u64,
    },
    /// The time pattern contains a specifier that cannot be formatted
    #[error("{0}: invalid time pattern")]
    TimePattern(String),
    /// The response header name derived from the directive is invalid
    #[error("{0}: invalid response header name")]
    HeaderName(String),
}

/// Errors produced when setting up the access log or while processing a request
#[derive(Debug, Error)]
pub enum Error {
    /// The log format could not be compiled
    #[error(transparent)]
    Format(#[from] FormatError),
    /// Both a log handle and a log file path were configured
    #[error("log handle and log file path are independent, only one can be configured")]
    SinkConflict,
    /// The log file could not be opened
    #[error("failed opening log file {}", .path.display())]
    OpenLog {
        /// Path of the log file
        path: PathBuf,
        /// The underlying error
        source: io::Error,
    },
    /// The configuration file could not be read
    #[error("failed reading configuration file {}", .path.display())]
    ReadConf {
        /// Path of the configuration file
        path: PathBuf,
        /// The underlying error
        source: io::Error,
    },
    /// The configuration could not be parsed
    #[error("failed parsing configuration")]
    ParseConf(#[from] serde_yaml::Error),
    /// Writing a log line failed
    #[error("failed writing log line")]
    Write(#[source] io::Error),
    /// The wrapped application failed to produce a response
    #[error("application failed to produce a response")]
    App(#[source] BoxError),
}
