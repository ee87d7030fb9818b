//! A minimal Web host for CGI-style child processes.
//!
//! Call it like this:
//!
//!     cgi-gateway -f config.toml
//!
//! The config file is in the [TOML format][toml] because it's commonly used
//! in the Rust ecosystem. Here is an example:
//!
//! ```toml
//! [listen]
//! port = 8000
//!
//! [cgi]
//! script = "/etc/cgi-gateway/probe.cgi"
//! timeout-ms = 5000
//! emit-empty-optional-vars = false
//! query-argv = true
//!
//! [cgi.env]
//! SERVER_ADMIN = "ops@example.org"
//! ```
//!
//! This example also serves as the defaults if no config file is provided,
//! or any given key is not present. If a key is of the wrong type, the
//! server will bail, so don't do that.
//!
//! Every request, whatever its path, runs the configured script once: the
//! request becomes the script's environment and stdin, the script's stdout
//! becomes the response. The server holds no other routes and speaks only
//! as much HTTP as that task needs.
//!
//! [toml]: https://github.com/toml-lang/toml

mod config;
mod errors;
mod gateway;
mod log_util;
mod server;

use crate::config::parser::{self, parse_file};
use crate::server::serve;

use clap::{Arg, Command};
use log::{error, info};

use std::env;
use std::io::{stderr, Write};
use std::process::exit;

fn main() {
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(log::LevelFilter::Info);

    if let Ok(var) = env::var("GATEWAY_LOG") {
        log_builder.parse_filters(&var);
    }

    match log_builder.try_init() {
        Ok(()) => (),
        Err(e) => {
            writeln!(stderr(),
                     "cgi-gateway: Error when initializing logging: {}",
                     e).unwrap();
            exit(1);
        }
    };

    let matches = Command::new("cgi-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(Arg::new("config_file")
             .short('f')
             .value_name("FILE")
             .help("The TOML file with server configuration"))
        .get_matches();

    let config = match matches.get_one::<String>("config_file") {
        None => Default::default(),
        Some(config_file) => match parse_file(config_file) {
            Ok(c) => c,
            Err(parser::Error::Io(e)) => {
                error!("Error opening config file {:?}: {}", config_file, e);
                exit(1);
            }
            Err(parser::Error::Parse(e)) => {
                error!("Error parsing config file {:?}: {}", config_file, e);
                exit(1);
            }
            Err(parser::Error::Validation(message)) => {
                error!("Error in config file: {}", message);
                exit(1);
            }
        },
    };

    info!("Starting server on port {}, script {}",
          config.port, config.cgi.script.display());
    if let Err(e) = serve(config) {
        error!("{}", e);
        exit(1);
    }
}
