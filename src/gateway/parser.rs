//! Parsers for CGI/1.1 child output
//!
//! The child writes `Key: Value` lines, one blank line, then the body.
//! `header` and `status` are the line-level grammar; `HeaderScanner` is
//! the incremental front that consumes stdout as it arrives and decides
//! between a real header block and the forgiving whole-output fallback.

use crate::gateway::{reason_phrase, Header, ParsedResponse, Status};

use nom::bytes::complete::{tag, take, take_till};
use nom::combinator::{all_consuming, map_res, opt, rest, verify};
use nom::sequence::preceded;
use nom::IResult;

use std::str::{self, FromStr};

/// Largest header block we are willing to buffer before giving up and
/// treating the whole output as a bare body.
const MAX_HEADER_WINDOW: usize = 64 * 1024;

fn is_colon(b: u8) -> bool {
    b == b':'
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes.iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |e| e + 1);
    &bytes[start..end]
}

/// One `Key: Value` line, its terminator already stripped.
///
/// The key is trimmed of surrounding whitespace and must be non-empty;
/// the value loses at most one leading space.
pub fn header(input: &[u8]) -> IResult<&[u8], Header> {
    let (input, name) =
        verify(take_till(is_colon), |n: &[u8]| !trim(n).is_empty())(input)?;
    let (input, _) = tag(":")(input)?;
    let (input, _) = opt(tag(" "))(input)?;
    let (remaining, content) = rest(input)?;

    Ok((remaining, Header {
        name: trim(name).to_vec(),
        content: content.to_vec(),
    }))
}

/// The value of a `Status:` header: three digits, optionally followed by
/// a reason phrase.
pub fn status(input: &[u8]) -> IResult<&[u8], Status> {
    let (input, code) = code(input)?;
    let (remaining, phrase) = opt(preceded(tag(" "), rest))(input)?;

    Ok((remaining, Status {
        code,
        reason_phrase: phrase.unwrap_or_default().to_vec(),
    }))
}

fn code(input: &[u8]) -> IResult<&[u8], u16> {
    map_res(
        map_res(
            verify(take(3usize), |d: &[u8]| d.iter().all(u8::is_ascii_digit)),
            str::from_utf8),
        FromStr::from_str)(input)
}

/// What one `push` of bytes got us
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Scan {
    /// Still inside the header block
    Incomplete,
    /// Blank line seen; headers are frozen
    Frozen,
    /// A line violated the header grammar (or the window overflowed);
    /// the entire output is body
    Fallback,
}

/// The scanner's verdict once no more bytes are coming (or headers froze)
#[derive(Debug)]
pub enum Parsed {
    Ok { response: ParsedResponse, body_prefix: Vec<u8> },
    Fallback { response: ParsedResponse, body_prefix: Vec<u8> },
    /// The child produced nothing at all
    Fatal,
}

enum State {
    Scanning,
    Frozen { body_start: usize },
    Degraded,
}

/// Incremental header-block recognizer
///
/// Feed it stdout bytes with `push` until it reports `Frozen` or
/// `Fallback` (or the stream ends), then take the verdict with `finish`.
/// Only the header block is ever buffered; body bytes past the separator
/// stay wherever `finish` hands them back.
pub struct HeaderScanner {
    buffer: Vec<u8>,
    line_start: usize,
    headers: Vec<Header>,
    explicit_status: Option<Status>,
    saw_location: bool,
    state: State,
}

impl HeaderScanner {
    pub fn new() -> HeaderScanner {
        HeaderScanner {
            buffer: Vec::with_capacity(1024),
            line_start: 0,
            headers: Vec::new(),
            explicit_status: None,
            saw_location: false,
            state: State::Scanning,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Scan {
        self.buffer.extend_from_slice(bytes);
        match self.state {
            State::Scanning => (),
            // Past the separator everything is body; keep it buffered
            // for whoever takes the verdict
            State::Frozen { .. } => return Scan::Frozen,
            State::Degraded => return Scan::Fallback,
        }

        loop {
            let newline = match self.buffer[self.line_start..].iter()
                .position(|&b| b == b'\n')
            {
                Some(at) => self.line_start + at,
                None => {
                    if self.buffer.len() > MAX_HEADER_WINDOW {
                        self.state = State::Degraded;
                        return Scan::Fallback;
                    }
                    return Scan::Incomplete;
                }
            };

            let mut line = &self.buffer[self.line_start..newline];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            if line.is_empty() {
                self.state = State::Frozen { body_start: newline + 1 };
                return Scan::Frozen;
            }

            // Taking the Header by value here ends the borrow of the
            // buffer before accept() needs the scanner back
            let parsed = all_consuming(header)(line).map(|(_, hdr)| hdr).ok();
            match parsed {
                Some(hdr) => {
                    self.accept(hdr);
                    self.line_start = newline + 1;
                }
                None => {
                    self.state = State::Degraded;
                    return Scan::Fallback;
                }
            }
        }
    }

    fn accept(&mut self, hdr: Header) {
        if hdr.name.eq_ignore_ascii_case(b"status") {
            // Consumed into the status line, never forwarded. An
            // unparseable value leaves the default in place.
            if let Ok((_, st)) = all_consuming(status)(&hdr.content[..]) {
                self.explicit_status = Some(st);
            }
            return;
        }

        if hdr.name.eq_ignore_ascii_case(b"location") {
            self.saw_location = true;
        }

        // Unique names, first-seen order; repeats merge comma-separated
        for existing in &mut self.headers {
            if existing.name.eq_ignore_ascii_case(&hdr.name) {
                existing.content.push(b',');
                existing.content.extend_from_slice(&hdr.content);
                return;
            }
        }
        self.headers.push(hdr);
    }

    pub fn finish(self) -> Parsed {
        match self.state {
            State::Frozen { body_start } => {
                let code = match &self.explicit_status {
                    Some(st) => st.code,
                    None if self.saw_location => 302,
                    None => 200,
                };
                let reason = match self.explicit_status {
                    Some(Status { ref reason_phrase, .. })
                        if !reason_phrase.is_empty() =>
                        String::from_utf8_lossy(reason_phrase).into_owned(),
                    _ => String::from(reason_phrase(code)),
                };

                Parsed::Ok {
                    response: ParsedResponse {
                        code,
                        reason,
                        headers: self.headers,
                    },
                    body_prefix: self.buffer[body_start..].to_vec(),
                }
            }
            State::Degraded => fallback(self.buffer),
            State::Scanning => {
                if self.buffer.is_empty() {
                    Parsed::Fatal
                } else {
                    // Output ended without ever closing the header block
                    fallback(self.buffer)
                }
            }
        }
    }
}

fn fallback(raw: Vec<u8>) -> Parsed {
    Parsed::Fallback {
        response: ParsedResponse {
            code: 200,
            reason: String::from(reason_phrase(200)),
            headers: vec![Header {
                name: Vec::from(&b"Content-Type"[..]),
                content: Vec::from(&b"text/plain"[..]),
            }],
        },
        body_prefix: raw,
    }
}
