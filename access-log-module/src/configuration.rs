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

//! Structures handling command line options and YAML deserialization for the Access Log Module

use clap::Args;
use log::trace;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Command line options of the access log module
#[derive(Debug, Default, Args)]
pub struct AccessLogOpt {
    /// Access log file path
    ///
    /// The special value - writes to standard output.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Access log format, either a preset name (common, combined, nginx_combined, rack_1_0) or a
    /// format string like "$remote_addr [$time_local] $status"
    #[arg(long)]
    pub log_format: Option<String>,
}

/// The log format to be used
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum LogFormat {
    /// Common log format used by Apache, `common` in config file
    #[default]
    Common,
    /// Combined log format used by Apache, `combined` in config file
    Combined,
    /// Combined log format used by nginx, `nginx_combined` in config file
    NginxCombined,
    /// Log format used by Rack 1.0, `rack_1_0` in config file
    Rack,
    /// A custom format string
    Custom(String),
}

impl LogFormat {
    /// Common log format, see <http://httpd.apache.org/docs/2.2/logs.html>
    pub const COMMON: &'static str =
        "$remote_addr - $remote_user [$time_local] \"$request\" $status $response_length";
    /// Combined log format, see <http://httpd.apache.org/docs/2.2/logs.html>
    pub const COMBINED: &'static str = "$remote_addr - $remote_user [$time_local] \
        \"$request\" $status $response_length \"$http_referer\" \"$http_user_agent\"";
    /// Combined log format used by nginx, see <http://wiki.nginx.org/NginxHttpLogModule>
    pub const NGINX_COMBINED: &'static str = "$remote_addr - $remote_user [$time_local] \
        \"$request\" $status $body_bytes_sent \"$http_referer\" \"$http_user_agent\"";
    /// Log format used by Rack 1.0
    pub const RACK: &'static str = "$ip - $remote_user [$time_local{%d/%b/%Y %H:%M:%S}] \
        \"$request\" $status $response_length $request_time{4}";

    /// The format string to be compiled
    pub fn as_str(&self) -> &str {
        match self {
            Self::Common => Self::COMMON,
            Self::Combined => Self::COMBINED,
            Self::NginxCombined => Self::NGINX_COMBINED,
            Self::Rack => Self::RACK,
            Self::Custom(format) => format,
        }
    }
}

impl From<&str> for LogFormat {
    fn from(value: &str) -> Self {
        match value {
            "common" => Self::Common,
            "combined" => Self::Combined,
            "nginx_combined" => Self::NginxCombined,
            "rack_1_0" => Self::Rack,
            format => Self::Custom(format.to_owned()),
        }
    }
}

impl From<String> for LogFormat {
    fn from(value: String) -> Self {
        value.as_str().into()
    }
}

/// Determines whether each request gets its own logging state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reentrancy {
    /// Decide for each request based on the host’s concurrency hint, isolating requests if the
    /// host doesn’t provide one
    #[default]
    Auto,
    /// Always isolate requests
    Always,
    /// Reuse a single logging state, only safe if requests are processed sequentially
    Never,
}

impl Reentrancy {
    /// Decides whether a request should get its own logging state.
    pub fn is_reentrant(self, multithread: Option<bool>) -> bool {
        match self {
            Self::Auto => multithread.unwrap_or(true),
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// Configuration settings of the access log module
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccessLogConf {
    /// Access log file path
    ///
    /// Without a log file, each line is written to the host’s diagnostic stream of the request or
    /// standard error. The special value `-` writes to standard output.
    pub log_file: Option<PathBuf>,
    /// Log format, either a preset name or a format string
    ///
    /// See [`LogFormat`] for the presets. The default is `common`.
    pub log_format: LogFormat,
    /// Output record separator added to the end of each line unless already present
    pub ors: String,
    /// Whether each request gets its own logging state
    pub reentrant: Reentrancy,
}

impl Default for AccessLogConf {
    fn default() -> Self {
        Self {
            log_file: None,
            log_format: LogFormat::default(),
            ors: "\n".to_owned(),
            reentrant: Reentrancy::default(),
        }
    }
}

impl AccessLogConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: AccessLogOpt) {
        if let Some(log_file) = opt.log_file {
            self.log_file = Some(log_file);
        }

        if let Some(log_format) = opt.log_format {
            self.log_format = log_format.into();
        }
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(yaml: impl AsRef<str>) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml.as_ref())?)
    }

    /// Loads configuration from a YAML file.
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::ReadConf {
            path: path.to_owned(),
            source,
        })?;
        let conf: Self = serde_yaml::from_reader(BufReader::new(file))?;
        trace!("Loaded configuration file: {conf:#?}");
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use std::io::Write;
    use test_log::test;

    #[derive(Debug, Parser)]
    struct Opt {
        #[command(flatten)]
        log: AccessLogOpt,
    }

    #[test]
    fn presets() {
        assert_eq!(LogFormat::from("common"), LogFormat::Common);
        assert_eq!(LogFormat::from("combined"), LogFormat::Combined);
        assert_eq!(LogFormat::from("nginx_combined"), LogFormat::NginxCombined);
        assert_eq!(LogFormat::from("rack_1_0"), LogFormat::Rack);
        assert_eq!(
            LogFormat::from("$status"),
            LogFormat::Custom("$status".to_owned())
        );

        assert_eq!(
            LogFormat::Combined.as_str(),
            format!(
                "{} \"$http_referer\" \"$http_user_agent\"",
                LogFormat::COMMON
            )
        );
        assert_eq!(
            LogFormat::NginxCombined.as_str(),
            LogFormat::COMBINED.replace("response_length", "body_bytes_sent")
        );
        assert_eq!(LogFormat::Custom("$pid".to_owned()).as_str(), "$pid");
    }

    #[test]
    fn reentrancy() {
        assert!(Reentrancy::Auto.is_reentrant(None));
        assert!(Reentrancy::Auto.is_reentrant(Some(true)));
        assert!(!Reentrancy::Auto.is_reentrant(Some(false)));
        assert!(Reentrancy::Always.is_reentrant(Some(false)));
        assert!(!Reentrancy::Never.is_reentrant(Some(true)));
    }

    #[test]
    fn yaml() {
        assert_eq!(AccessLogConf::from_yaml("{}").unwrap(), AccessLogConf::default());

        let conf = AccessLogConf::from_yaml(
            r#"
                log_file: access.log
                log_format: combined
                ors: ""
                reentrant: never
            "#,
        )
        .unwrap();
        assert_eq!(
            conf,
            AccessLogConf {
                log_file: Some("access.log".into()),
                log_format: LogFormat::Combined,
                ors: String::new(),
                reentrant: Reentrancy::Never,
            }
        );

        let conf = AccessLogConf::from_yaml("log_format: \"$ip $status\"").unwrap();
        assert_eq!(conf.log_format.as_str(), "$ip $status");

        assert!(matches!(
            AccessLogConf::from_yaml("unknown_field: 1"),
            Err(Error::ParseConf(_))
        ));
        assert!(AccessLogConf::from_yaml("reentrant: sometimes").is_err());
    }

    #[test]
    fn yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"log_format: nginx_combined\n").unwrap();

        let conf = AccessLogConf::load_from_yaml(file.path()).unwrap();
        assert_eq!(conf.log_format, LogFormat::NginxCombined);
        assert_eq!(conf.ors, "\n");

        assert!(matches!(
            AccessLogConf::load_from_yaml(file.path().with_extension("missing")),
            Err(Error::ReadConf { .. })
        ));
    }

    #[test]
    fn command_line() {
        let mut conf = AccessLogConf::default();
        conf.merge_with_opt(Opt::parse_from(["test"]).log);
        assert_eq!(conf, AccessLogConf::default());

        conf.merge_with_opt(
            Opt::parse_from(["test", "--log-file", "-", "--log-format", "rack_1_0"]).log,
        );
        assert_eq!(conf.log_file, Some(PathBuf::from("-")));
        assert_eq!(conf.log_format, LogFormat::Rack);
    }
}
