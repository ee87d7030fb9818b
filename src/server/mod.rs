//! The minimal HTTP front end
//!
//! One connection carries one request: accept, parse the head, hand the
//! request to the gateway, close. Keep-alive, routing and friends are
//! somebody else's job.

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::gateway::driver::Gateway;

use log::warn;

use std::io::{self, BufWriter, Chain, Cursor, Read, Write};
use std::iter;
use std::marker::PhantomData;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::slice;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Binds the configured port and serves the configured script forever.
pub fn serve(config: Config) -> Result<()> {
    let gateway = Arc::new(Gateway::new(config.cgi.clone())?);
    let listener = TcpListener::bind(("0.0.0.0", config.port))?;

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let handler = Arc::clone(&gateway);
                thread::spawn(move || handle_connection(stream, &*handler));
            }
            Err(e) => {
                warn!("Failed connection: {}", e);
            }
        }
    }

    Ok(())
}

fn handle_connection<H: Handler>(stream: TcpStream, handler: &H) {
    if let Err(e) = handle_connection_inner(stream, handler) {
        warn!("Error serving a connection: {}", e);
    }
}

fn handle_connection_inner<H: Handler>(stream: TcpStream, handler: &H)
                                       -> Result<()>
{
    stream.set_read_timeout(Some(Duration::new(5, 0)))?;
    stream.set_write_timeout(Some(Duration::new(5, 0)))?;

    match make_request_pair(stream.try_clone()?) {
        Ok((req, res)) => handler.serve(req, res),
        Err(Error::Parse(_)) | Err(Error::RequestIncomplete) => {
            error_messages::error_400(Response::new(stream))?;
        }
        Err(e) => return Err(e),
    }

    Ok(())
}

pub(crate) fn make_request_pair(stream: TcpStream)
    -> Result<(Request, Response<Fresh>)>
{
    let remote_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    let response_inner = stream.try_clone()?;

    let response = Response::new(response_inner);
    let request = Request::parse(stream, remote_addr, local_addr)?;

    Ok((request, response))
}

/// Values which can handle requests
pub trait Handler {
    fn serve(&self, req: Request, res: Response<Fresh>);
}

impl<F> Handler for F where F: Fn(Request, Response<Fresh>) {
    fn serve(&self, req: Request, res: Response<Fresh>) {
        self(req, res)
    }
}

/// The parsed request line and headers, split from the body stream
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    /// Request path with the query string already split off
    pub path: String,
    /// Query string without the `?`; empty when there was none
    pub query: String,
    pub headers: Headers,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// An incoming request from the client
///
/// Reading from it yields the request body, whatever of it has not been
/// consumed yet.
#[derive(Debug)]
pub struct Request {
    head: RequestHead,
    body: Chain<Cursor<Vec<u8>>, TcpStream>,
}

impl Request {
    fn parse(mut stream: TcpStream, remote_addr: SocketAddr,
             local_addr: SocketAddr) -> Result<Request>
    {
        let (leftover, method, path, query, headers) =
            parse_inner(&mut stream)?;

        Ok(Request {
            head: RequestHead {
                method,
                path,
                query,
                headers,
                remote_addr,
                local_addr,
            },
            body: Cursor::new(leftover).chain(stream),
        })
    }

    #[inline]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.head.method
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// Splits the request into its metadata and the body stream
    pub fn into_parts(self) -> (RequestHead, Chain<Cursor<Vec<u8>>, TcpStream>)
    {
        (self.head, self.body)
    }
}

impl Read for Request {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }
}

/// Largest request head accepted before the parse gives up
const MAX_REQUEST_HEAD: usize = 64 * 1024;

/// Reads and parses a request head, however many reads it takes.
///
/// The first element of the result is whatever was read past the end of
/// the head; those are the first bytes of the body.
fn parse_inner<R: Read>(mut source: R)
    -> Result<(Vec<u8>, String, String, String, Headers)>
{
    let mut buffer = Vec::with_capacity(1024);
    let mut window = [0u8; 1024];

    loop {
        let read = source.read(&mut window)?;
        if read == 0 {
            return Err(Error::RequestIncomplete);
        }
        buffer.extend_from_slice(&window[..read]);

        // The parsed entries borrow the buffer, so the scratch array
        // cannot outlive the iteration
        let mut headers = [httparse::EMPTY_HEADER; 100];
        let mut req = httparse::Request::new(&mut headers);

        if let httparse::Status::Complete(bytes) = req.parse(&buffer)? {
            let mut parsed = Headers::new();
            for header in req.headers.iter() {
                parsed.insert(header.name, Vec::from(header.value));
            }

            let target = req.path.unwrap();
            let (path, query) = match target.split_once('?') {
                Some((path, query)) => (path, query),
                None => (target, ""),
            };

            return Ok((buffer[bytes..].to_vec(),
                       String::from(req.method.unwrap()),
                       String::from(path),
                       String::from(query),
                       parsed));
        }

        if buffer.len() > MAX_REQUEST_HEAD {
            return Err(Error::RequestIncomplete);
        }
    }
}

/// A map of HTTP headers
///
/// Keys are case-normalized on input: the first word, and any word after
/// a hyphen, is capitalized, everything else lowercased. Insertion order
/// is preserved; inserting an existing key appends comma-separated.
#[derive(Debug, Clone)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>,
}

fn normalize_header_name(name: &str) -> String {
    let lowercased = name.to_ascii_lowercase();
    let mut lower_chars = lowercased.chars();

    let mut normalized = String::with_capacity(lowercased.len());
    match lower_chars.next() {
        Some(ch) => normalized.push(ch.to_ascii_uppercase()),
        None => return normalized,
    }

    let mut after_hyphen = false;
    for ch in lower_chars {
        if ch == '-' {
            after_hyphen = true;
            normalized.push(ch);
        } else if after_hyphen {
            normalized.push(ch.to_ascii_uppercase());
            after_hyphen = false;
        } else {
            normalized.push(ch);
        }
    }

    normalized
}

impl Headers {
    pub fn new() -> Headers {
        Headers { entries: Vec::new() }
    }

    pub fn insert(&mut self, key: &str, mut value: Vec<u8>) {
        let key = normalize_header_name(key);
        for entry in &mut self.entries {
            if entry.0 == key {
                entry.1.reserve(value.len() + 1);
                entry.1.push(b',');
                entry.1.append(&mut value);
                return;
            }
        }
        self.entries.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&Vec<u8>> {
        let key = normalize_header_name(key);
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Headers {
    fn default() -> Headers {
        Headers::new()
    }
}

fn entry_pair(entry: &(String, Vec<u8>)) -> (&String, &Vec<u8>) {
    (&entry.0, &entry.1)
}

type EntryPairFn<'a> = fn(&'a (String, Vec<u8>)) -> (&'a String, &'a Vec<u8>);

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a String, &'a Vec<u8>);
    type IntoIter = iter::Map<slice::Iter<'a, (String, Vec<u8>)>,
                              EntryPairFn<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().map(entry_pair as EntryPairFn<'a>)
    }
}

/// The response being constructed by a `Handler`
///
/// The type parameter marks where in the cycle this response is. While
/// `State = Fresh` nothing has been sent, so the status and headers can
/// still change. `start` commits them; the `State = Streaming` response
/// only accepts body bytes, which go straight to the client. Bodies are
/// delimited by connection close, so there is no trailer to write.
pub struct Response<State> {
    writer: BufWriter<TcpStream>,
    status: ResponseStatus,
    headers: Headers,
    _state: PhantomData<State>,
}

/// A marker for `Response`, indicating nothing has been sent yet
pub enum Fresh {}

/// A marker for `Response`, indicating headers have been committed
pub enum Streaming {}

struct ResponseStatus {
    code: u16,
    reason: String,
}

impl Response<Fresh> {
    pub fn new(stream: TcpStream) -> Self {
        Response {
            writer: BufWriter::new(stream),
            status: ResponseStatus {
                code: 200,
                reason: String::from("OK"),
            },
            headers: Headers::new(),
            _state: PhantomData,
        }
    }

    /// Writes the whole response in one shot from a readable source
    pub fn of_stream<R: Read>(mut self, mut stream: R) -> io::Result<()> {
        self.write_headers()?;
        io::copy(&mut stream, &mut self.writer)?;
        self.writer.flush()
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn set_status(&mut self, code: u16, reason: String) {
        self.status = ResponseStatus { code, reason };
    }

    /// Commits the status line and headers; what remains is the body
    pub fn start(mut self) -> io::Result<Response<Streaming>> {
        self.write_headers()?;

        Ok(Response {
            writer: self.writer,
            status: self.status,
            headers: self.headers,
            _state: PhantomData,
        })
    }

    fn write_headers(&mut self) -> io::Result<()> {
        write!(self.writer, "HTTP/1.1 {} {}\r\n",
               self.status.code, self.status.reason)?;

        for (header, content) in &self.headers {
            write!(self.writer, "{}: ", header)?;
            self.writer.write_all(content)?;
            self.writer.write_all(b"\r\n")?;
        }

        self.writer.write_all(b"Connection: close\r\n\r\n")?;

        // Redirects and error pages should not sit in the buffer
        // waiting for body bytes that may never come
        self.writer.flush()
    }
}

impl Write for Response<Streaming> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub mod error_messages {
    use super::{Fresh, Response};

    use std::io;

    fn canned(mut res: Response<Fresh>, code: u16, reason: &str,
              body: &'static [u8]) -> io::Result<()>
    {
        res.set_status(code, String::from(reason));
        {
            let headers = res.headers_mut();
            headers.insert("Content-Type", Vec::from(&b"text/html"[..]));
            headers.insert("Content-Length",
                           body.len().to_string().into_bytes());
        }

        res.of_stream(body)
    }

    pub fn error_400(res: Response<Fresh>) -> io::Result<()> {
        canned(res, 400, "Bad Request", ERROR_400)
    }

    const ERROR_400: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Bad Request</h1><p>Your request had some kind of bad syntax. Are you using netcat?</p></body></html>";

    pub fn error_500(res: Response<Fresh>) -> io::Result<()> {
        canned(res, 500, "Internal Error", ERROR_500)
    }

    const ERROR_500: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Internal Error</h1><p>Something went wrong on my side.</p><p>There's nothing you can do; maybe come back later.</p></body></html>";

    pub fn error_502(res: Response<Fresh>) -> io::Result<()> {
        canned(res, 502, "Bad Gateway", ERROR_502)
    }

    const ERROR_502: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Bad Gateway</h1><p>The program that was supposed to answer this request had nothing to say.</p></body></html>";

    pub fn error_504(res: Response<Fresh>) -> io::Result<()> {
        canned(res, 504, "Gateway Timeout", ERROR_504)
    }

    const ERROR_504: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Gateway Timeout</h1><p>The program that was supposed to answer this request took too long.</p></body></html>";
}
