//! Driving one child process per request
//!
//! The request thread stays in charge of stdout; the request body is
//! pumped in from a second thread and a watchdog thread holds the kill
//! switch for the wall-clock deadline. The child leads its own process
//! group and the kill targets the group, so anything it forked dies
//! with it and both pipes close; neither pump nor parse can block past
//! the deadline.

use crate::config::CgiConfig;
use crate::errors::{Error, Result};
use crate::gateway::invocation::{self, RequestInfo};
use crate::gateway::parser::{HeaderScanner, Parsed, Scan};
use crate::gateway::{InvocationDescriptor, ParsedResponse};
use crate::log_util::ascii_escape;
use crate::server::{error_messages, Fresh, Handler, Request, Response};

use log::{debug, error, info, warn};

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The per-request gateway handler
pub struct Gateway {
    config: CgiConfig,
    active: AtomicUsize,
}

impl Gateway {
    /// Validates the configured script up front; per-request work should
    /// only fail for per-request reasons.
    pub fn new(config: CgiConfig) -> Result<Gateway> {
        invocation::validate_script(&config.script)?;
        Ok(Gateway {
            config,
            active: AtomicUsize::new(0),
        })
    }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn serve_inner(&self, req: Request, mut res: Response<Fresh>) {
        let (head, body) = req.into_parts();
        let info = RequestInfo {
            method: &head.method,
            path: &head.path,
            query: &head.query,
            headers: &head.headers,
            remote_addr: head.remote_addr,
            local_addr: head.local_addr,
        };

        let built = invocation::build(&self.config, &info, body)
            .and_then(|desc| execute(desc, self.config.timeout));

        let mut completed = match built {
            Ok(completed) => completed,
            Err(e) => {
                error!("{} {}: {}", head.method, head.path, e);
                if let Err(io_err) = failure_response(res, &e) {
                    debug!("client gone before failure response: {}", io_err);
                }
                return;
            }
        };

        info!("{} {} -> {}{}", head.method, head.path,
              completed.response.code,
              if completed.fallback { " (fallback body)" } else { "" });

        res.set_status(completed.response.code,
                       completed.response.reason.clone());
        for hdr in &completed.response.headers {
            res.headers_mut().insert(&String::from_utf8_lossy(&hdr.name),
                                     hdr.content.clone());
        }

        // Headers are committed once start() succeeds; from here on,
        // failures can only be logged.
        let mut res = match res.start() {
            Ok(streaming) => streaming,
            Err(e) => {
                warn!("client disconnected before headers: {}", e);
                completed.abort();
                return;
            }
        };

        match io::copy(&mut completed, &mut res) {
            Ok(_) => {
                if let Err(e) = res.flush() {
                    warn!("client disconnected at end of body: {}", e);
                }
                let _ = completed.finish();
            }
            Err(e) => {
                warn!("client disconnected mid-body: {}", e);
                completed.abort();
            }
        }
    }
}

impl Handler for Gateway {
    fn serve(&self, req: Request, res: Response<Fresh>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.serve_inner(req, res);
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Translate a gateway failure into the right canned client response.
/// None of these bodies carry paths, environment values or other
/// internals; the detail went to the log already.
fn failure_response(res: Response<Fresh>, error: &Error) -> io::Result<()> {
    match error {
        Error::Timeout => error_messages::error_504(res),
        Error::EmptyOutput => error_messages::error_502(res),
        _ => error_messages::error_500(res),
    }
}

/// What the stdin pump managed to deliver
struct PumpReport {
    declared: u64,
    sent: u64,
    error: Option<io::Error>,
}

/// Spawns the descriptor's child and consumes its output until the
/// header block resolves one way or the other.
///
/// `Err` covers everything that still maps cleanly onto a failure
/// response: spawn errors, the deadline expiring before headers, a child
/// that wrote nothing. A `Completed` means headers are frozen and the
/// rest of stdout is the body, readable off the `Completed` itself.
pub fn execute<R>(desc: InvocationDescriptor<R>, timeout: Duration)
                  -> Result<Completed>
    where R: Read + Send + 'static
{
    let InvocationDescriptor { program, working_dir, args, env, body } = desc;

    let mut command = Command::new(&program);
    command.args(&args[1..])
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&working_dir)
        .stdin(if body.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // The child leads its own process group so the deadline kill
        // reaches whatever it forked; a forked helper inherits the
        // stdout pipe and would keep it open past the parent's death
        .process_group(0);

    let mut child = command.spawn().map_err(Error::Spawn)?;
    let pgid = child.id() as i32;

    let stdin = child.stdin.take();
    let mut stdout = child.stdout.take().ok_or_else(|| Error::Spawn(
        io::Error::new(io::ErrorKind::BrokenPipe, "child stdout not piped")
    ))?;
    let stderr = child.stderr.take();

    let deadline = Instant::now() + timeout;

    // Watchdog: kills the group at the deadline unless disarmed first.
    // Reports whether it fired.
    let (disarm, armed) = mpsc::channel::<()>();
    let watchdog = thread::spawn(move || match armed.recv_timeout(timeout) {
        Err(RecvTimeoutError::Timeout) => {
            kill_group(pgid);
            true
        }
        _ => false,
    });

    let stderr_log = stderr.map(|stderr| thread::spawn(move || {
        let mut lines = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match lines.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    while line.last() == Some(&b'\n')
                        || line.last() == Some(&b'\r')
                    {
                        line.pop();
                    }
                    if !line.is_empty() {
                        warn!("child stderr: {}", ascii_escape(&line));
                    }
                }
            }
        }
    }));

    let pump = match (body, stdin) {
        (Some(mut body), Some(mut stdin)) => Some(thread::spawn(move || {
            let declared = body.declared_len;
            let mut window = [0u8; 4096];
            let mut sent = 0u64;
            loop {
                let read = match body.reader.read(&mut window) {
                    Ok(0) => break PumpReport { declared, sent, error: None },
                    Ok(n) => n,
                    Err(e) => break PumpReport {
                        declared, sent, error: Some(e)
                    },
                };
                if let Err(e) = stdin.write_all(&window[..read]) {
                    break PumpReport { declared, sent, error: Some(e) };
                }
                sent += read as u64;
            }
            // stdin drops here, closing the child's input
        })),
        _ => None,
    };

    let mut io_state = ChildIo {
        child,
        pgid,
        deadline,
        disarm: Some(disarm),
        watchdog: Some(watchdog),
        pump,
        stderr_log,
        done: None,
    };

    let mut scanner = HeaderScanner::new();
    let mut window = [0u8; 4096];
    let resolved = loop {
        let read = match stdout.read(&mut window) {
            Ok(n) => n,
            // ChildIo's drop kills and reaps on this path
            Err(e) => return Err(Error::Io(e)),
        };
        if read == 0 {
            break false;
        }
        match scanner.push(&window[..read]) {
            Scan::Incomplete => (),
            Scan::Frozen | Scan::Fallback => break true,
        }
    };

    if !resolved {
        // stdout closed before the header block did. Find out whether
        // that was the watchdog's doing.
        let summary = io_state.shutdown(false);
        if summary.timed_out {
            return Err(Error::Timeout);
        }
        if scanner.is_empty() {
            return Err(Error::EmptyOutput);
        }
    }

    let (response, fallback, prefix) = match scanner.finish() {
        Parsed::Ok { response, body_prefix } => (response, false, body_prefix),
        Parsed::Fallback { response, body_prefix } => {
            warn!("child output is not a header block; forwarding verbatim");
            (response, true, body_prefix)
        }
        Parsed::Fatal => return Err(Error::EmptyOutput),
    };

    Ok(Completed {
        response,
        fallback,
        prefix: io::Cursor::new(prefix),
        stdout,
        io_state,
    })
}

/// A child whose headers have resolved; reading yields the body
pub struct Completed {
    pub response: ParsedResponse,
    /// True when the body is the forgiving whole-output fallback
    pub fallback: bool,
    prefix: io::Cursor<Vec<u8>>,
    stdout: ChildStdout,
    io_state: ChildIo,
}

impl Read for Completed {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.prefix.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        self.stdout.read(buf)
    }
}

impl Completed {
    /// Reap the child and surface its epilogue in the log. Call after
    /// the body has been forwarded.
    pub fn finish(mut self) -> ExitSummary {
        let summary = self.io_state.shutdown(false);
        log_summary(&summary);
        summary
    }

    /// Kill the child and clean up; for when the client went away.
    pub fn abort(mut self) {
        let summary = self.io_state.shutdown(true);
        log_summary(&summary);
    }
}

/// The child's epilogue, for observability and tests
#[derive(Debug, Clone)]
pub struct ExitSummary {
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    /// `(sent, declared)` request-body accounting, when there was a body
    pub body_sent: Option<(u64, u64)>,
}

fn log_summary(summary: &ExitSummary) {
    if summary.timed_out {
        warn!("child exceeded its time budget and was killed");
    }
    match summary.status {
        Some(status) if !status.success() =>
            warn!("child exited unsuccessfully: {}", status),
        None => warn!("child never delivered an exit status"),
        _ => (),
    }
    if let Some((sent, declared)) = summary.body_sent {
        if sent < declared {
            warn!("client body ended early: {} of {} declared bytes",
                  sent, declared);
        }
    }
}

/// Everything needed to wind one invocation down exactly once
struct ChildIo {
    child: Child,
    pgid: i32,
    deadline: Instant,
    disarm: Option<mpsc::Sender<()>>,
    watchdog: Option<JoinHandle<bool>>,
    pump: Option<JoinHandle<PumpReport>>,
    stderr_log: Option<JoinHandle<()>>,
    done: Option<ExitSummary>,
}

impl ChildIo {
    fn shutdown(&mut self, kill_now: bool) -> ExitSummary {
        if let Some(done) = &self.done {
            return done.clone();
        }

        if kill_now {
            kill_group(self.pgid);
        }

        let status = reap(&mut self.child, self.deadline, self.pgid);

        // Dropping the sender wakes the watchdog if it hasn't fired
        self.disarm.take();
        let timed_out = self.watchdog.take()
            .map_or(false, |w| w.join().unwrap_or(false));

        let body_sent = self.pump.take()
            .and_then(|p| p.join().ok())
            .map(|report| {
                if let Some(e) = report.error {
                    debug!("request body pump stopped: {}", e);
                }
                (report.sent, report.declared)
            });

        if let Some(log) = self.stderr_log.take() {
            let _ = log.join();
        }

        let done = ExitSummary { status, timed_out, body_sent };
        self.done = Some(done.clone());
        done
    }
}

impl Drop for ChildIo {
    fn drop(&mut self) {
        if self.done.is_none() {
            self.shutdown(true);
        }
    }
}

/// Signals the whole group; the child is its leader. Failure means the
/// group is already gone, which is the outcome wanted anyway.
fn kill_group(pgid: i32) {
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

/// Wait the child out, by polling so a watchdog kill can land while we
/// wait. Past the deadline the group is killed; past a further grace
/// period it is abandoned.
fn reap(child: &mut Child, deadline: Instant, pgid: i32)
        -> Option<ExitStatus>
{
    const GRACE: Duration = Duration::from_secs(1);

    let mut killed = false;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                let now = Instant::now();
                if now >= deadline + GRACE {
                    return None;
                }
                if now >= deadline && !killed {
                    kill_group(pgid);
                    killed = true;
                }
            }
            Err(_) => return None,
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Headers;

    use std::fs;
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn probe_script(body: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "cgi-gateway-test-{}-{}.sh",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)));
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .unwrap();
        path
    }

    fn descriptor(script: &Path, body: Option<&[u8]>)
                  -> InvocationDescriptor<Cursor<Vec<u8>>>
    {
        let config = CgiConfig {
            script: script.to_path_buf(),
            ..Default::default()
        };

        let mut headers = Headers::new();
        if let Some(bytes) = body {
            headers.insert("Content-Length",
                           bytes.len().to_string().into_bytes());
        }

        let info = RequestInfo {
            method: "POST",
            path: "/probe",
            query: "",
            headers: &headers,
            remote_addr: "127.0.0.1:40000".parse().unwrap(),
            local_addr: "127.0.0.1:8000".parse().unwrap(),
        };

        invocation::build(&config, &info,
                          Cursor::new(body.unwrap_or(&[]).to_vec())).unwrap()
    }

    fn run_echo(body: &[u8]) -> Vec<u8> {
        let script = probe_script(
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'; cat");
        let desc = descriptor(&script, Some(body));

        let mut completed = execute(desc, Duration::from_secs(10)).unwrap();
        let mut delivered = Vec::new();
        completed.read_to_end(&mut delivered).unwrap();

        let summary = completed.finish();
        assert!(summary.status.unwrap().success());
        assert!(!summary.timed_out);

        fs::remove_file(&script).unwrap();
        delivered
    }

    #[test]
    fn echo_round_trip_empty_body() {
        assert_eq!(run_echo(b""), b"");
    }

    #[test]
    fn echo_round_trip_one_byte() {
        assert_eq!(run_echo(b"x"), b"x");
    }

    #[test]
    fn echo_round_trip_large_body() {
        // Much larger than the 4 KiB streaming window
        let body: Vec<u8> = (0..(64 * 1024 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        assert_eq!(run_echo(&body), body);
    }

    #[test]
    fn stdin_is_capped_at_declared_length() {
        let script = probe_script(
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'; wc -c");

        // Descriptor declares 5 bytes; hand the pump more than that
        let config = CgiConfig {
            script: script.clone(),
            ..Default::default()
        };
        let mut headers = Headers::new();
        headers.insert("Content-Length", Vec::from(&b"5"[..]));
        let info = RequestInfo {
            method: "POST",
            path: "/probe",
            query: "",
            headers: &headers,
            remote_addr: "127.0.0.1:40000".parse().unwrap(),
            local_addr: "127.0.0.1:8000".parse().unwrap(),
        };
        let desc = invocation::build(
            &config, &info,
            Cursor::new(Vec::from(&b"hello and a lot more"[..]))).unwrap();

        let mut completed = execute(desc, Duration::from_secs(10)).unwrap();
        let mut delivered = Vec::new();
        completed.read_to_end(&mut delivered).unwrap();
        let summary = completed.finish();

        let counted = String::from_utf8(delivered).unwrap();
        assert_eq!(counted.trim(), "5");
        assert_eq!(summary.body_sent, Some((5, 5)));

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn no_output_is_fatal() {
        let script = probe_script("exit 0");
        let desc = descriptor(&script, None);

        match execute(desc, Duration::from_secs(10)) {
            Err(Error::EmptyOutput) => (),
            other => panic!("{:?}", other.map(|c| c.response)),
        }

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn location_alone_redirects() {
        let script = probe_script("printf 'Location: /elsewhere\\r\\n\\r\\n'");
        let desc = descriptor(&script, None);

        let mut completed = execute(desc, Duration::from_secs(10)).unwrap();
        assert_eq!(completed.response.code, 302);
        assert_eq!(completed.response.headers.len(), 1);
        assert_eq!(completed.response.headers[0].content, b"/elsewhere");

        let mut body = Vec::new();
        completed.read_to_end(&mut body).unwrap();
        assert!(body.is_empty());
        completed.finish();

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn overrunning_child_is_killed() {
        let script = probe_script("sleep 30");
        let desc = descriptor(&script, None);

        let started = Instant::now();
        match execute(desc, Duration::from_millis(250)) {
            Err(Error::Timeout) => (),
            other => panic!("{:?}", other.map(|c| c.response)),
        }
        // timeout plus bounded overhead, nowhere near the child's 30 s
        assert!(started.elapsed() < Duration::from_secs(5));

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn overrun_kills_forked_helpers_too() {
        // The backgrounded sleeper inherits the stdout write end;
        // killing the shell alone would leave the pipe open for the
        // sleeper's full 30 seconds
        let script = probe_script("sleep 30 &\nwait");
        let desc = descriptor(&script, None);

        let started = Instant::now();
        match execute(desc, Duration::from_millis(250)) {
            Err(Error::Timeout) => (),
            other => panic!("{:?}", other.map(|c| c.response)),
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn client_disconnect_mid_body_reaps_the_child() {
        let script = probe_script(
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
             while :; do printf 'xxxxxxxxxxxxxxxx'; done");
        let config = CgiConfig {
            script: script.clone(),
            timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let gateway = Gateway::new(config).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(b"GET /probe HTTP/1.1\r\n\r\n").unwrap();
            let mut taste = [0u8; 1024];
            let _ = client.read(&mut taste);
            // dropping the socket is the hangup
        });

        let (accepted, _) = listener.accept().unwrap();
        let (req, res) = crate::server::make_request_pair(accepted).unwrap();

        let started = Instant::now();
        gateway.serve(req, res);
        client.join().unwrap();

        // The child would stream forever; only the hangup path killing
        // it lets serve return this early
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(gateway.active_requests(), 0);

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn nonzero_exit_does_not_retract_the_response() {
        let script = probe_script(
            "printf 'Content-Type: text/plain\\r\\n\\r\\nstill here'; exit 3");
        let desc = descriptor(&script, None);

        let mut completed = execute(desc, Duration::from_secs(10)).unwrap();
        assert_eq!(completed.response.code, 200);

        let mut body = Vec::new();
        completed.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"still here");

        let summary = completed.finish();
        assert_eq!(summary.status.unwrap().code(), Some(3));

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn child_ignoring_stdin_cannot_wedge_the_request() {
        let script = probe_script(
            "printf 'Content-Type: text/plain\\r\\n\\r\\nignored you'");
        // Far more body than the pipe buffer holds
        let body = vec![b'z'; 4 * 1024 * 1024];
        let desc = descriptor(&script, Some(&body));

        let mut completed = execute(desc, Duration::from_secs(10)).unwrap();
        let mut delivered = Vec::new();
        completed.read_to_end(&mut delivered).unwrap();
        assert_eq!(delivered, b"ignored you");
        completed.finish();

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn malformed_output_falls_back_to_raw_body() {
        let script = probe_script("printf 'hello, no headers here'");
        let desc = descriptor(&script, None);

        let mut completed = execute(desc, Duration::from_secs(10)).unwrap();
        assert!(completed.fallback);
        assert_eq!(completed.response.code, 200);

        let mut body = Vec::new();
        completed.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello, no headers here");
        completed.finish();

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let desc = descriptor(Path::new("/nonexistent/probe.cgi"), None);

        match execute(desc, Duration::from_secs(10)) {
            Err(Error::Spawn(_)) => (),
            other => panic!("{:?}", other.map(|c| c.response)),
        }
    }

    #[test]
    fn timeout_failure_releases_the_counter() {
        let script = probe_script("sleep 30");
        let config = CgiConfig {
            script: script.clone(),
            timeout: Duration::from_millis(250),
            ..Default::default()
        };
        let gateway = Gateway::new(config).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"GET /probe HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();

        let (accepted, _) = listener.accept().unwrap();
        let (req, res) = crate::server::make_request_pair(accepted).unwrap();
        gateway.serve(req, res);

        assert_eq!(gateway.active_requests(), 0);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 504"));

        fs::remove_file(&script).unwrap();
    }

    #[test]
    fn gateway_rejects_unusable_script_at_startup() {
        let config = CgiConfig {
            script: PathBuf::from("/nonexistent/probe.cgi"),
            ..Default::default()
        };
        match Gateway::new(config) {
            Err(Error::Config(_)) => (),
            other => panic!("{:?}", other.map(|g| g.active_requests())),
        }
    }
}
