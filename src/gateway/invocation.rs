//! Building child process invocations from requests
//!
//! The environment handed to a child is constructed from scratch for
//! every request; nothing from the host's own environment leaks in, so
//! concurrent invocations stay fully independent.

use crate::config::CgiConfig;
use crate::errors::{Error, Result};
use crate::gateway::{Body, InvocationDescriptor};
use crate::server::Headers;

use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const SERVER_SOFTWARE: &str = concat!("cgi-gateway/", env!("CARGO_PKG_VERSION"));

/// The request metadata a child's environment is derived from
pub struct RequestInfo<'a> {
    pub method: &'a str,
    /// Request path, query string already split off
    pub path: &'a str,
    /// Query string without the leading `?`; empty when absent
    pub query: &'a str,
    pub headers: &'a Headers,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Checks a script path at startup: it must exist, be a file, and carry
/// an execute bit.
pub fn validate_script(script: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if script.as_os_str().is_empty() {
        return Err(Error::Config(String::from("no script path configured")));
    }

    let meta = fs::metadata(script).map_err(|e| Error::Config(
        format!("script {}: {}", script.display(), e)
    ))?;

    if meta.is_dir() {
        return Err(Error::Config(
            format!("script {} is a directory", script.display())
        ));
    }

    if meta.permissions().mode() & 0o111 == 0 {
        return Err(Error::Config(
            format!("script {} is not executable", script.display())
        ));
    }

    Ok(())
}

/// Resolves one request into an [`InvocationDescriptor`].
///
/// `body_source` is the remainder of the client stream; it is capped at
/// the declared content length and read lazily, never buffered whole.
pub fn build<R: Read>(config: &CgiConfig, info: &RequestInfo,
                      body_source: R) -> Result<InvocationDescriptor<R>>
{
    if config.script.as_os_str().is_empty() {
        return Err(Error::Config(String::from("no script path configured")));
    }

    let program = config.script.clone();
    let working_dir = program.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let mut args = vec![program.to_string_lossy().into_owned()];
    if config.query_argv && !info.query.is_empty()
        && !info.query.contains('=')
    {
        // RFC 3875 search-string convention: an indexed query becomes
        // decoded argv tokens
        args.extend(info.query.split('+').map(decode_token));
    }

    let declared = declared_length(info.headers);

    let mut env = Vec::with_capacity(16 + info.headers.len());
    push_var(&mut env, "GATEWAY_INTERFACE", String::from("CGI/1.1"));
    push_var(&mut env, "REQUEST_METHOD", String::from(info.method));
    push_var(&mut env, "SCRIPT_NAME", String::from(info.path));
    push_var(&mut env, "SCRIPT_FILENAME",
             program.to_string_lossy().into_owned());

    if !info.query.is_empty() || config.emit_empty_optional_vars {
        push_var(&mut env, "QUERY_STRING", String::from(info.query));
    }
    match declared {
        Some(n) => push_var(&mut env, "CONTENT_LENGTH", n.to_string()),
        None if config.emit_empty_optional_vars =>
            push_var(&mut env, "CONTENT_LENGTH", String::new()),
        None => (),
    }
    match info.headers.get("Content-Type") {
        Some(ct) => push_var(&mut env, "CONTENT_TYPE",
                             String::from_utf8_lossy(ct).into_owned()),
        None if config.emit_empty_optional_vars =>
            push_var(&mut env, "CONTENT_TYPE", String::new()),
        None => (),
    }

    push_var(&mut env, "REMOTE_ADDR", info.remote_addr.ip().to_string());
    push_var(&mut env, "REMOTE_PORT", info.remote_addr.port().to_string());
    push_var(&mut env, "SERVER_ADDR", info.local_addr.ip().to_string());
    push_var(&mut env, "SERVER_PORT", info.local_addr.port().to_string());

    let server_name = match info.headers.get("Host") {
        Some(host) => String::from_utf8_lossy(host).into_owned(),
        None => info.local_addr.ip().to_string(),
    };
    push_var(&mut env, "SERVER_NAME", server_name);
    push_var(&mut env, "SERVER_PROTOCOL", String::from("HTTP/1.1"));
    push_var(&mut env, "SERVER_SOFTWARE", String::from(SERVER_SOFTWARE));

    for (name, value) in info.headers {
        push_var(&mut env,
                 &format!("HTTP_{}",
                          name.replace('-', "_").to_ascii_uppercase()),
                 String::from_utf8_lossy(value).into_owned());
    }

    for (key, value) in &config.extra_env {
        push_var(&mut env, key, value.clone());
    }

    Ok(InvocationDescriptor {
        program,
        working_dir,
        args,
        env,
        body: declared.map(|n| Body::new(n, body_source)),
    })
}

/// The declared body length, if it is usable. A non-numeric value is
/// treated as no declaration at all, the way permissive gateways do.
fn declared_length(headers: &Headers) -> Option<u64> {
    let raw = headers.get("Content-Length")?;
    let text = std::str::from_utf8(raw).ok()?;
    text.trim().parse::<u64>().ok()
}

/// Keys stay unique; a repeat replaces the earlier value, so config
/// extras override derived entries.
fn push_var(env: &mut Vec<(String, String)>, key: &str, value: String) {
    for entry in env.iter_mut() {
        if entry.0 == key {
            entry.1 = value;
            return;
        }
    }
    env.push((String::from(key), value));
}

fn decode_token(token: &str) -> String {
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len()
            && is_hexit(bytes[i + 1]) && is_hexit(bytes[i + 2])
        {
            out.push(from_hexit(bytes[i + 1]) << 4 | from_hexit(bytes[i + 2]));
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_hexit(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

fn from_hexit(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::io::{self, Read};

    fn test_config() -> CgiConfig {
        CgiConfig {
            script: PathBuf::from("/srv/cgi/probe.cgi"),
            ..Default::default()
        }
    }

    fn test_info(headers: &Headers) -> RequestInfo {
        RequestInfo {
            method: "POST",
            path: "/probe",
            query: "",
            headers,
            remote_addr: "198.51.100.7:49152".parse().unwrap(),
            local_addr: "192.0.2.1:8000".parse().unwrap(),
        }
    }

    fn var<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn environment_mapping_is_deterministic_and_unique() {
        let mut headers = Headers::new();
        headers.insert("X-Test", Vec::from(&b"abc"[..]));
        headers.insert("Content-Length", Vec::from(&b"5"[..]));

        let desc = build(&test_config(), &test_info(&headers),
                         io::empty()).unwrap();

        assert_eq!(var(&desc.env, "REQUEST_METHOD"), Some("POST"));
        assert_eq!(var(&desc.env, "CONTENT_LENGTH"), Some("5"));
        assert_eq!(var(&desc.env, "HTTP_X_TEST"), Some("abc"));
        assert_eq!(var(&desc.env, "SCRIPT_NAME"), Some("/probe"));
        assert_eq!(var(&desc.env, "SCRIPT_FILENAME"),
                   Some("/srv/cgi/probe.cgi"));
        assert_eq!(var(&desc.env, "REMOTE_ADDR"), Some("198.51.100.7"));

        let mut seen = HashSet::new();
        for (key, _) in &desc.env {
            assert!(seen.insert(key.clone()), "duplicate key {}", key);
        }
    }

    #[test]
    fn optional_vars_are_omitted_by_default() {
        let headers = Headers::new();
        let desc = build(&test_config(), &test_info(&headers),
                         io::empty()).unwrap();

        assert_eq!(var(&desc.env, "QUERY_STRING"), None);
        assert_eq!(var(&desc.env, "CONTENT_LENGTH"), None);
        assert_eq!(var(&desc.env, "CONTENT_TYPE"), None);
        assert!(desc.body.is_none());
    }

    #[test]
    fn optional_vars_can_be_emitted_empty() {
        let mut config = test_config();
        config.emit_empty_optional_vars = true;

        let headers = Headers::new();
        let desc = build(&config, &test_info(&headers), io::empty()).unwrap();

        assert_eq!(var(&desc.env, "QUERY_STRING"), Some(""));
        assert_eq!(var(&desc.env, "CONTENT_LENGTH"), Some(""));
        assert_eq!(var(&desc.env, "CONTENT_TYPE"), Some(""));
    }

    #[test]
    fn non_numeric_length_means_no_body() {
        let mut headers = Headers::new();
        headers.insert("Content-Length", Vec::from(&b"banana"[..]));

        let desc = build(&test_config(), &test_info(&headers),
                         io::empty()).unwrap();

        assert_eq!(var(&desc.env, "CONTENT_LENGTH"), None);
        assert!(desc.body.is_none());
    }

    #[test]
    fn body_is_capped_at_declared_length() {
        let mut headers = Headers::new();
        headers.insert("Content-Length", Vec::from(&b"5"[..]));

        let over_sent = io::Cursor::new(Vec::from(&b"hello, way too much"[..]));
        let desc = build(&test_config(), &test_info(&headers),
                         over_sent).unwrap();

        let mut body = desc.body.unwrap();
        assert_eq!(body.declared_len, 5);

        let mut delivered = Vec::new();
        body.reader.read_to_end(&mut delivered).unwrap();
        assert_eq!(delivered, b"hello");
    }

    #[test]
    fn search_string_query_becomes_argv() {
        let headers = Headers::new();
        let mut info = test_info(&headers);
        info.query = "cat+fa%63ts";

        let desc = build(&test_config(), &info, io::empty()).unwrap();
        assert_eq!(desc.args,
                   vec![String::from("/srv/cgi/probe.cgi"),
                        String::from("cat"),
                        String::from("facts")]);
        assert_eq!(var(&desc.env, "QUERY_STRING"), Some("cat+fa%63ts"));
    }

    #[test]
    fn key_value_query_stays_out_of_argv() {
        let headers = Headers::new();
        let mut info = test_info(&headers);
        info.query = "name=felix&kind=cat";

        let desc = build(&test_config(), &info, io::empty()).unwrap();
        assert_eq!(desc.args.len(), 1);
    }

    #[test]
    fn query_argv_can_be_disabled() {
        let mut config = test_config();
        config.query_argv = false;

        let headers = Headers::new();
        let mut info = test_info(&headers);
        info.query = "one+two";

        let desc = build(&config, &info, io::empty()).unwrap();
        assert_eq!(desc.args.len(), 1);
    }

    #[test]
    fn extra_env_overrides_derived_entries() {
        let mut config = test_config();
        config.extra_env.push((String::from("SERVER_SOFTWARE"),
                               String::from("probe-rig")));

        let headers = Headers::new();
        let desc = build(&config, &test_info(&headers), io::empty()).unwrap();
        assert_eq!(var(&desc.env, "SERVER_SOFTWARE"), Some("probe-rig"));
    }

    #[test]
    fn working_dir_is_the_script_parent() {
        let headers = Headers::new();
        let desc = build(&test_config(), &test_info(&headers),
                         io::empty()).unwrap();
        assert_eq!(desc.working_dir, PathBuf::from("/srv/cgi"));
    }

    #[test]
    fn empty_script_path_is_a_config_error() {
        let config = CgiConfig {
            script: PathBuf::new(),
            ..Default::default()
        };

        let headers = Headers::new();
        match build(&config, &test_info(&headers), io::empty()) {
            Err(Error::Config(_)) => (),
            other => panic!("{:?}", other.map(|d| d.program)),
        }
    }
}
