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

//! Handler wrapping an application and logging its responses

use bytes::Bytes;
use http::HeaderMap;
use log::{error, warn};
use std::fmt::{Debug, Formatter};
use std::io::{self, stdout};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime};

use crate::configuration::{AccessLogConf, Reentrancy};
use crate::error::{BoxError, Error};
use crate::exchange::{Body, Capabilities, Env, Response, SharedWriter};
use crate::program::Program;
use crate::writer::{Evaluators, Exchange, Sink};

/// Resolves the parent directory, so that the file stays the same if the working directory changes.
fn normalize_path(path: PathBuf) -> Result<PathBuf, Error> {
    if let Some(parent) = path.parent() {
        let mut parent = if parent.as_os_str().is_empty() {
            PathBuf::from(".").canonicalize()
        } else {
            parent.canonicalize()
        }
        .map_err(|source| Error::OpenLog {
            path: path.clone(),
            source,
        })?;
        if let Some(name) = path.file_name() {
            parent.push(name);
        }
        Ok(parent)
    } else {
        // Absolute path in the root, leave unchanged
        Ok(path)
    }
}

fn open_sink(log_file: Option<PathBuf>) -> Result<Sink, Error> {
    match log_file {
        None => Ok(Sink::Fallback),
        Some(path) if path.as_os_str() == "-" => Ok(Sink::Writer(Arc::new(Mutex::new(stdout())))),
        Some(path) => Sink::open(&normalize_path(path)?),
    }
}

/// An application producing responses, typically the next handler in the chain
pub trait Application: Send + Sync {
    /// Produces the response for a request.
    fn call(&self, env: &Env) -> Result<Response, BoxError>;
}

impl<F> Application for F
where
    F: Fn(&Env) -> Result<Response, BoxError> + Send + Sync,
{
    fn call(&self, env: &Env) -> Result<Response, BoxError> {
        self(env)
    }
}

/// Logging state of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The line is written as soon as the response is known
    Immediate,
    /// The line is written once the response body is closed
    AwaitingBody,
    /// The line has been written
    Finalized,
}

#[derive(Debug)]
struct ExchangeState {
    phase: Phase,
    generation: u64,
    env: Env,
    status: i128,
    headers: Option<HeaderMap>,
    body_bytes_sent: u64,
    start: Instant,
    end: Option<Instant>,
}

impl ExchangeState {
    fn new(env: Env, status: i128, headers: Option<HeaderMap>, start: Instant) -> Self {
        Self {
            phase: Phase::AwaitingBody,
            generation: 0,
            env,
            status,
            headers,
            body_bytes_sent: 0,
            start,
            end: None,
        }
    }
}

fn lock(state: &Mutex<ExchangeState>) -> MutexGuard<'_, ExchangeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything needed to produce a log line, shared by the handler and the bodies it wraps
#[derive(Debug, Clone)]
struct Logger {
    program: Arc<Program>,
    sink: Sink,
    evaluators: Evaluators,
}

impl Logger {
    fn log(
        &self,
        env: &Env,
        status: i128,
        headers: Option<&HeaderMap>,
        body_bytes_sent: Option<u64>,
        start: Instant,
        end: Instant,
    ) -> Result<(), Error> {
        let exchange = Exchange {
            env,
            status,
            headers,
            body_bytes_sent,
            start,
            end,
            now: SystemTime::now(),
            evaluators: Some(&self.evaluators),
        };
        self.sink.write(env, &self.program.render(&exchange))
    }

    fn log_state(&self, state: &ExchangeState) -> Result<(), Error> {
        self.log(
            &state.env,
            state.status,
            state.headers.as_ref(),
            Some(state.body_bytes_sent),
            state.start,
            state.end.unwrap_or_else(Instant::now),
        )
    }
}

/// Handler logging each exchange with the wrapped application
///
/// If the log format depends on the number of bytes sent or on the request duration, the line is
/// only written once the response body returned by [`AccessLogHandler::call`] is closed or
/// dropped. Otherwise the line is written before the response is returned.
pub struct AccessLogHandler<A> {
    app: A,
    logger: Arc<Logger>,
    reentrancy: Reentrancy,
    shared: Arc<Mutex<ExchangeState>>,
}

impl<A> Debug for AccessLogHandler<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLogHandler")
            .field("program", &self.logger.program)
            .field("sink", &self.logger.sink)
            .field("reentrancy", &self.reentrancy)
            .finish_non_exhaustive()
    }
}

impl<A: Application> AccessLogHandler<A> {
    fn with_sink(app: A, conf: AccessLogConf, sink: Sink) -> Result<Self, Error> {
        let program = Program::compile_cached(conf.log_format.as_str(), &conf.ors)?;
        Ok(Self {
            app,
            logger: Arc::new(Logger {
                program,
                sink,
                evaluators: Evaluators::new(),
            }),
            reentrancy: conf.reentrant,
            shared: Arc::new(Mutex::new(ExchangeState {
                phase: Phase::Finalized,
                ..ExchangeState::new(Env::new(), 0, None, Instant::now())
            })),
        })
    }

    /// Creates a handler writing to the configured log file, or to the diagnostic stream of each
    /// request if there is none.
    pub fn new(app: A, mut conf: AccessLogConf) -> Result<Self, Error> {
        let sink = open_sink(conf.log_file.take())?;
        Self::with_sink(app, conf, sink)
    }

    /// Creates a handler writing to the given log handle. The configuration must not specify a
    /// log file in this case.
    pub fn with_logger(app: A, conf: AccessLogConf, logger: SharedWriter) -> Result<Self, Error> {
        if conf.log_file.is_some() {
            return Err(Error::SinkConflict);
        }
        Self::with_sink(app, conf, Sink::Writer(logger))
    }

    /// Sets the callbacks available to `$e{name}` directives.
    pub fn with_evaluators(mut self, evaluators: Evaluators) -> Self {
        Arc::make_mut(&mut self.logger).evaluators = evaluators;
        self
    }

    /// The compiled log format
    pub fn program(&self) -> &Program {
        &self.logger.program
    }

    /// The logging state each exchange starts out in
    pub fn initial_phase(&self) -> Phase {
        if self.logger.program.needs_deferred_completion() {
            Phase::AwaitingBody
        } else {
            Phase::Immediate
        }
    }

    /// Runs the application for a request and logs the exchange.
    ///
    /// If the application fails, a line with status 500 is logged before the error is returned.
    pub fn call(&self, env: Env) -> Result<Response, Error> {
        let start = Instant::now();

        let response = match self.app.call(&env) {
            Ok(response) => response,
            Err(err) => {
                let logged = self
                    .logger
                    .log(&env, 500, None, None, start, Instant::now());
                if let Err(log_err) = logged {
                    error!("Failed logging request with application error: {log_err}");
                }
                return Err(Error::App(err));
            }
        };

        let headers = if self.logger.program.needs_response_headers() {
            Some(response.headers.clone())
        } else {
            None
        };

        if self.initial_phase() == Phase::Immediate {
            self.logger.log(
                &env,
                response.status,
                headers.as_ref(),
                Some(0),
                start,
                Instant::now(),
            )?;
            return Ok(response);
        }

        let state = ExchangeState::new(env, response.status, headers, start);
        Ok(Response {
            status: response.status,
            headers: response.headers,
            body: Box::new(self.wrap_body(state, response.body)),
        })
    }

    /// Checks whether a request gets its own logging state
    pub fn is_reentrant(&self, env: &Env) -> bool {
        self.reentrancy.is_reentrant(env.multithread())
    }

    fn wrap_body(&self, state: ExchangeState, inner: Box<dyn Body>) -> LoggedBody {
        let mut reentrant = self.is_reentrant(&state.env);
        let (state, generation) = if reentrant {
            (Arc::new(Mutex::new(state)), 0)
        } else {
            let mut shared = lock(&self.shared);
            if shared.phase == Phase::AwaitingBody {
                // The previous exchange hasn't closed its body yet, it keeps the shared state
                warn!("Overlapping exchanges with non-reentrant logging, isolating the later one");
                reentrant = true;
                (Arc::new(Mutex::new(state)), 0)
            } else {
                let generation = shared.generation.wrapping_add(1);
                *shared = ExchangeState {
                    generation,
                    ..state
                };
                (self.shared.clone(), generation)
            }
        };

        LoggedBody {
            inner,
            state,
            generation,
            logger: self.logger.clone(),
            reentrant,
            started: false,
            closed: false,
        }
    }
}

/// Response body counting the bytes sent and writing the log line once closed
pub struct LoggedBody {
    inner: Box<dyn Body>,
    state: Arc<Mutex<ExchangeState>>,
    generation: u64,
    logger: Arc<Logger>,
    reentrant: bool,
    started: bool,
    closed: bool,
}

impl Debug for LoggedBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggedBody")
            .field("capabilities", &self.inner.capabilities())
            .field("reentrant", &self.reentrant)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl LoggedBody {
    /// Checks whether this exchange got its own logging state
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    /// Current logging state of the exchange
    pub fn phase(&self) -> Phase {
        let state = lock(&self.state);
        if state.generation == self.generation {
            state.phase
        } else {
            // The shared state has been taken over by a later exchange
            Phase::Finalized
        }
    }

    /// Checks whether the logging state is shared with other exchanges
    pub fn shares_state_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn finalize(&self) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if state.generation != self.generation || state.phase == Phase::Finalized {
            return Ok(());
        }

        state.phase = Phase::Finalized;
        state.end = Some(Instant::now());
        self.logger.log_state(&state)
    }

    fn finalize_or_report(&self) {
        if let Err(err) = self.finalize() {
            error!("Failed writing access log line: {err}");
        }
    }
}

impl Body for LoggedBody {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if !self.started {
            self.started = true;
            let mut state = lock(&self.state);
            if state.generation == self.generation {
                state.body_bytes_sent = 0;
            }
        }

        match self.inner.next_chunk()? {
            Ok(chunk) => {
                let mut state = lock(&self.state);
                if state.generation == self.generation {
                    state.body_bytes_sent += chunk.len() as u64;
                }
                Some(Ok(chunk))
            }
            Err(err) => {
                self.finalize_or_report();
                Some(Err(err))
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = self.inner.close();
        let logged = self.finalize();
        if let Err(err) = result {
            if let Err(log_err) = logged {
                error!("Failed writing access log line: {log_err}");
            }
            return Err(err);
        }
        logged.map_err(io::Error::other)
    }

    fn path(&self) -> Option<&Path> {
        let path = self.inner.path()?;
        match path.metadata() {
            Ok(metadata) => {
                let mut state = lock(&self.state);
                if state.generation == self.generation {
                    state.body_bytes_sent = metadata.len();
                }
            }
            Err(err) => warn!(
                "Failed determining size of response body {}: {err}",
                path.display()
            ),
        }
        Some(path)
    }
}

impl Drop for LoggedBody {
    fn drop(&mut self) {
        self.finalize_or_report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::env::current_dir;
    use test_log::test;

    #[test]
    fn path_normalization() {
        let cwd = current_dir().unwrap().canonicalize().unwrap();
        let mut root = cwd.clone();
        while let Some(parent) = root.parent() {
            root = parent.into();
        }

        assert_eq!(
            normalize_path("file.txt".into()).unwrap(),
            cwd.join("file.txt")
        );
        assert_eq!(
            normalize_path("./file.txt".into()).unwrap(),
            cwd.join("file.txt")
        );
        assert_eq!(
            normalize_path("../file.txt".into()).unwrap(),
            cwd.parent().unwrap().join("file.txt")
        );
        assert_eq!(
            normalize_path(cwd.join("file.txt")).unwrap(),
            cwd.join("file.txt")
        );
        assert_eq!(
            normalize_path(root.join("file.txt")).unwrap(),
            root.join("file.txt")
        );
        assert!(matches!(
            normalize_path(cwd.join("does-not-exist").join("file.txt")),
            Err(Error::OpenLog { .. })
        ));
    }

    #[test]
    fn phases() {
        fn app(_: &Env) -> Result<Response, BoxError> {
            Ok(Response::new(200, crate::exchange::ChunkedBody::default()))
        }

        let output: SharedWriter = Arc::new(Mutex::new(Vec::<u8>::new()));
        let handler = |format: &str| {
            let conf = AccessLogConf {
                log_format: format.into(),
                ..Default::default()
            };
            AccessLogHandler::with_logger(app, conf, output.clone()).unwrap()
        };

        assert_eq!(handler("$status").initial_phase(), Phase::Immediate);
        assert_eq!(handler("$status").program().operations().len(), 2);
        assert_eq!(handler("$request_time").initial_phase(), Phase::AwaitingBody);
        assert_eq!(handler("$body_bytes_sent").initial_phase(), Phase::AwaitingBody);
        assert_eq!(handler("$response_length").initial_phase(), Phase::AwaitingBody);
    }

    #[test]
    fn wrapping() {
        fn app(_: &Env) -> Result<Response, BoxError> {
            Ok(Response::new(200, crate::exchange::ChunkedBody::default()))
        }

        let output: SharedWriter = Arc::new(Mutex::new(Vec::<u8>::new()));
        let handler = |reentrant: Reentrancy| {
            let conf = AccessLogConf {
                log_format: "$request_time".into(),
                reentrant,
                ..Default::default()
            };
            AccessLogHandler::with_logger(app, conf, output.clone()).unwrap()
        };
        let wrap = |handler: &AccessLogHandler<_>, multithread: Option<bool>| {
            let mut env = Env::new();
            if let Some(multithread) = multithread {
                env.set_multithread(multithread);
            }
            let state = ExchangeState::new(env, 200, None, Instant::now());
            handler.wrap_body(state, Box::new(crate::exchange::ChunkedBody::default()))
        };

        let auto = handler(Reentrancy::Auto);
        let first = wrap(&auto, Some(true));
        let second = wrap(&auto, None);
        assert!(first.is_reentrant());
        assert!(second.is_reentrant());
        assert!(!first.shares_state_with(&second));
        assert_eq!(first.phase(), Phase::AwaitingBody);

        let first = wrap(&auto, Some(false));
        assert!(!first.is_reentrant());
        assert_eq!(first.phase(), Phase::AwaitingBody);

        // Overlapping exchange gets its own state, the first one stays pending
        let second = wrap(&auto, Some(false));
        assert!(second.is_reentrant());
        assert!(!first.shares_state_with(&second));
        assert_eq!(first.phase(), Phase::AwaitingBody);
        assert_eq!(second.phase(), Phase::AwaitingBody);

        first.finalize().unwrap();
        assert_eq!(first.phase(), Phase::Finalized);
        let third = wrap(&auto, Some(false));
        assert!(!third.is_reentrant());
        assert!(first.shares_state_with(&third));
        assert_eq!(first.phase(), Phase::Finalized);
        assert_eq!(third.phase(), Phase::AwaitingBody);

        let always = handler(Reentrancy::Always);
        assert!(wrap(&always, Some(false)).is_reentrant());

        let never = handler(Reentrancy::Never);
        assert!(!wrap(&never, Some(true)).is_reentrant());
    }

    #[test]
    fn sink_conflict() {
        fn app(_: &Env) -> Result<Response, BoxError> {
            Ok(Response::new(200, crate::exchange::ChunkedBody::default()))
        }

        let conf = AccessLogConf {
            log_file: Some("access.log".into()),
            ..Default::default()
        };
        let output: SharedWriter = Arc::new(Mutex::new(Vec::<u8>::new()));
        assert!(matches!(
            AccessLogHandler::with_logger(app, conf, output),
            Err(Error::SinkConflict)
        ));
    }
}
