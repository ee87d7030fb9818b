pub mod parser;

use std::path::PathBuf;
use std::time::Duration;

/// A holder for app configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port number to listen on
    pub port: u16,
    pub cgi: CgiConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 8000,
            cgi: Default::default(),
        }
    }
}

/// Settings for the child-process gateway
#[derive(Debug, Clone)]
pub struct CgiConfig {
    /// The program run once per request
    pub script: PathBuf,
    /// Wall-clock budget for one child; the child is killed past this
    pub timeout: Duration,
    /// Set optional metavariables (QUERY_STRING, CONTENT_TYPE,
    /// CONTENT_LENGTH) to the empty string instead of omitting them
    pub emit_empty_optional_vars: bool,
    /// RFC 3875 search-string convention: a query string without `=`
    /// becomes decoded argv tokens
    pub query_argv: bool,
    /// Additional environment entries passed to every invocation
    pub extra_env: Vec<(String, String)>,
}

impl Default for CgiConfig {
    fn default() -> CgiConfig {
        CgiConfig {
            script: PathBuf::from("/etc/cgi-gateway/probe.cgi"),
            timeout: Duration::from_secs(5),
            emit_empty_optional_vars: false,
            query_argv: true,
            extra_env: Vec::new(),
        }
    }
}
