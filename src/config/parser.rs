use super::*;
use toml::{Table, Value};

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

pub fn parse_file<P: AsRef<std::path::Path>>(conf: P) -> Result<Config, Error> {
    let mut source = String::new();
    {
        let mut f = File::open(conf).map_err(Error::Io)?;
        f.read_to_string(&mut source).map_err(Error::Io)?;
    }

    match source.parse::<Table>() {
        Ok(table) => config_from_table(&table),
        Err(e) => Err(Error::Parse(e)),
    }
}

fn config_from_table(table: &Table) -> Result<Config, Error> {
    let mut config: Config = Default::default();

    match lookup(table, "listen.port") {
        Some(&Value::Integer(p)) if p > 0 && p <= u16::MAX as i64 =>
            config.port = p as u16,
        Some(&Value::Integer(p)) => return Err(Error::Validation(
            format!("The given port {} is out of range", p)
        )),
        Some(val) => return Err(Error::Validation(
            format!("Expected the port to be an integer, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    match lookup(table, "cgi.script") {
        Some(Value::String(path)) =>
            config.cgi.script = PathBuf::from(path),
        Some(val) => return Err(Error::Validation(
            format!("Expected the script path to be a string, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    match lookup(table, "cgi.timeout-ms") {
        Some(&Value::Integer(ms)) if ms > 0 =>
            config.cgi.timeout = Duration::from_millis(ms as u64),
        Some(&Value::Integer(ms)) => return Err(Error::Validation(
            format!("The given timeout {} ms is not positive", ms)
        )),
        Some(val) => return Err(Error::Validation(
            format!("Expected the timeout to be an integer, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    match lookup(table, "cgi.emit-empty-optional-vars") {
        Some(&Value::Boolean(b)) => config.cgi.emit_empty_optional_vars = b,
        Some(val) => return Err(Error::Validation(
            format!("Expected emit-empty-optional-vars to be a boolean, \
                     got a {}", val.type_str())
        )),
        None => ()
    }

    match lookup(table, "cgi.query-argv") {
        Some(&Value::Boolean(b)) => config.cgi.query_argv = b,
        Some(val) => return Err(Error::Validation(
            format!("Expected query-argv to be a boolean, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    match lookup(table, "cgi.env") {
        Some(Value::Table(env)) => {
            for (key, val) in env {
                match val {
                    Value::String(s) => config.cgi.extra_env
                        .push((key.clone(), s.clone())),
                    other => return Err(Error::Validation(
                        format!("Expected env entry {} to be a string, \
                                 got a {}", key, other.type_str())
                    )),
                }
            }
        },
        Some(val) => return Err(Error::Validation(
            format!("Expected cgi.env to be a table, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    Ok(config)
}

/// Walk a dotted path of nested tables, `lookup`-style.
fn lookup<'a>(table: &'a Table, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = table.get(segments.next()?)?;

    for segment in segments {
        current = current.as_table()?.get(segment)?;
    }

    Some(current)
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(toml::de::Error),
    Validation(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
