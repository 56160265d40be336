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

//! Request and response data exchanged with the hosting application

use bytes::Bytes;
use enumset::{EnumSet, EnumSetType};
use http::HeaderMap;
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A byte destination shared between the handler and the requests it processes
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Request attributes, keyed by CGI-style names like `REQUEST_METHOD` or `HTTP_USER_AGENT`
#[derive(Clone, Default)]
pub struct Env {
    vars: HashMap<String, Vec<u8>>,
    input_len: Option<u64>,
    multithread: Option<bool>,
    errors: Option<SharedWriter>,
}

impl Debug for Env {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("vars", &self.vars)
            .field("input_len", &self.input_len)
            .field("multithread", &self.multithread)
            .field("errors", &self.errors.is_some())
            .finish()
    }
}

impl Env {
    /// Creates an empty request environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attribute, builder-style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets an attribute, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Removes an attribute
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.vars.remove(key)
    }

    /// Looks up an attribute by its exact name
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.vars.get(key).map(Vec::as_slice)
    }

    /// Length of the request payload if known
    pub fn input_len(&self) -> Option<u64> {
        self.input_len
    }

    /// Sets the length of the request payload
    pub fn set_input_len(&mut self, len: u64) {
        self.input_len = Some(len);
    }

    /// Host hint whether requests might be processed concurrently
    pub fn multithread(&self) -> Option<bool> {
        self.multithread
    }

    /// Sets the host concurrency hint
    pub fn set_multithread(&mut self, multithread: bool) {
        self.multithread = Some(multithread);
    }

    /// Diagnostic stream of the host, used when no log sink is configured
    pub fn errors(&self) -> Option<&SharedWriter> {
        self.errors.as_ref()
    }

    /// Sets the diagnostic stream of the host
    pub fn set_errors(&mut self, errors: SharedWriter) {
        self.errors = Some(errors);
    }
}

/// Optional abilities of a response body
#[derive(Debug, EnumSetType)]
pub enum Capability {
    /// Body data can be retrieved chunk by chunk via [`Body::next_chunk`]
    Streamable,

    /// Body is backed by a file, [`Body::path`] returns its location
    PathBacked,
}

/// Set of [`Capability`] flags
pub type Capabilities = EnumSet<Capability>;

/// A response body
///
/// Hosts are expected to either stream the body via `next_chunk` or, if the body is path-backed,
/// send the file at `path` directly. Either way, `close` has to be called once done.
pub trait Body: Send {
    /// Abilities of this body
    fn capabilities(&self) -> Capabilities;

    /// Retrieves the next chunk of data, `None` once all data has been produced
    fn next_chunk(&mut self) -> Option<io::Result<Bytes>>;

    /// Releases resources held by the body
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Location of the file this body is backed by
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// A response produced by an application
pub struct Response {
    /// Response status, not necessarily a valid HTTP status code
    pub status: i128,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Box<dyn Body>,
}

impl Debug for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body.capabilities())
            .finish()
    }
}

impl Response {
    /// Creates a response without headers
    pub fn new(status: impl Into<i128>, body: impl Body + 'static) -> Self {
        Self {
            status: status.into(),
            headers: HeaderMap::new(),
            body: Box::new(body),
        }
    }

    /// Replaces response headers, builder-style
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// An in-memory body consisting of a number of chunks
#[derive(Debug, Default)]
pub struct ChunkedBody {
    chunks: VecDeque<Bytes>,
    closed: bool,
}

impl ChunkedBody {
    /// Creates a body producing the given chunks in order
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            closed: false,
        }
    }

    /// Checks whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Body for ChunkedBody {
    fn capabilities(&self) -> Capabilities {
        Capability::Streamable.into()
    }

    fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.chunks.pop_front().map(Ok)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// A body serving a file from disk
#[derive(Debug)]
pub struct FileBody {
    path: PathBuf,
    file: Option<File>,
    buf_size: usize,
}

impl FileBody {
    const DEFAULT_BUF_SIZE: usize = 64 * 1024;

    /// Opens the file at the given path
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
            buf_size: Self::DEFAULT_BUF_SIZE,
        })
    }
}

impl Body for FileBody {
    fn capabilities(&self) -> Capabilities {
        Capability::Streamable | Capability::PathBacked
    }

    fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        let file = self.file.as_mut()?;
        let mut buf = vec![0; self.buf_size];
        match file.read(&mut buf) {
            Ok(0) => None,
            Ok(len) => {
                buf.truncate(len);
                Some(Ok(buf.into()))
            }
            Err(err) => Some(Err(err)),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn env_lookup() {
        let mut env = Env::new()
            .with("REQUEST_METHOD", "GET")
            .with("PATH_INFO", b"/\xff".as_slice());
        env.set_input_len(5);

        assert_eq!(env.get("REQUEST_METHOD"), Some(b"GET".as_slice()));
        assert_eq!(env.get("request_method"), None);
        assert_eq!(env.get("PATH_INFO"), Some(b"/\xff".as_slice()));
        assert_eq!(env.input_len(), Some(5));
        assert_eq!(env.multithread(), None);

        assert_eq!(env.remove("REQUEST_METHOD"), Some(b"GET".to_vec()));
        assert_eq!(env.get("REQUEST_METHOD"), None);
    }

    #[test]
    fn chunked_body() {
        let mut body = ChunkedBody::new(["ab", "c"]);
        assert!(body.capabilities().contains(Capability::Streamable));
        assert!(!body.capabilities().contains(Capability::PathBacked));
        assert_eq!(body.next_chunk().unwrap().unwrap(), "ab");
        assert_eq!(body.next_chunk().unwrap().unwrap(), "c");
        assert!(body.next_chunk().is_none());
        assert!(!body.is_closed());
        body.close().unwrap();
        assert!(body.is_closed());
    }

    #[test]
    fn file_body() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let mut body = FileBody::open(file.path()).unwrap();
        assert!(body.capabilities().contains(Capability::PathBacked));
        assert_eq!(body.path(), Some(file.path()));
        assert_eq!(body.next_chunk().unwrap().unwrap(), "hello world");
        assert!(body.next_chunk().is_none());
        body.close().unwrap();
        assert!(body.next_chunk().is_none());
    }
}
