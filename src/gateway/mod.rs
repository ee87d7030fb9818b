//! The CGI-style invocation contract
//!
//! One request becomes one child process. `invocation` turns the request
//! into an [`InvocationDescriptor`], `driver` runs the child, and `parser`
//! turns the child's stdout back into an HTTP response.

pub mod driver;
pub mod invocation;
pub mod parser;

use std::io::{Read, Take};
use std::path::PathBuf;

/// A fully resolved child process execution: program, argv, environment
/// and the request-body source.
///
/// Built once per request and consumed at spawn. The environment is an
/// explicit, isolated mapping; the child never sees the host's own
/// environment.
pub struct InvocationDescriptor<R> {
    pub program: PathBuf,
    /// Directory the child runs in (the script's parent)
    pub working_dir: PathBuf,
    /// Full argument vector. `args[0]` is the program path by convention
    /// and carries no meaning of its own.
    pub args: Vec<String>,
    /// Unique, case-sensitive keys
    pub env: Vec<(String, String)>,
    /// Absent entirely when the request declared no (usable) length
    pub body: Option<Body<R>>,
}

/// The request body as the child will see it: exactly `declared_len`
/// bytes, fewer only if the client hangs up early.
pub struct Body<R> {
    pub declared_len: u64,
    pub reader: Take<R>,
}

impl<R: Read> Body<R> {
    pub fn new(declared_len: u64, source: R) -> Body<R> {
        Body {
            declared_len,
            reader: source.take(declared_len),
        }
    }
}

/// A status line override from the child's `Status:` header
#[derive(Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason_phrase: Vec<u8>,
}

/// One header from the child's output
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Header {
    pub name: Vec<u8>,
    pub content: Vec<u8>,
}

/// The frozen header portion of a child response
///
/// `headers` has unique names and preserves the order the child wrote
/// them in; the `Status:` pseudo-header is consumed into `code` and never
/// appears here.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedResponse {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<Header>,
}

/// Stock reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
