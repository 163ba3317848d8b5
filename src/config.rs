//! Broker configuration: a flat `key = value` file with `#` comments.

use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::store::DbKind;
use crate::{Error, Result};

/// Typed view over the broker configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    pub spool: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub log_ident: String,
    pub log_facility: String,
    pub db_max_queue_size: u32,
    pub db_type: DbKind,
    pub backlog: u32,
    pub no_login: bool,
    pub persist_db: PathBuf,
    pub users_db: PathBuf,
    pub listen: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|err| Error::Config(format!("{}: {err}", path.as_ref().display())))?;
        Ok(Self::from_map(&parse_pairs(&text)))
    }

    fn from_map(map: &HashMap<String, String>) -> Config {
        let get = |key: &str| map.get(key).map(String::as_str).unwrap_or("");

        let db_max_queue_size = match map.get("db_max_queue_size") {
            Some(raw) => raw.parse::<u32>().unwrap_or(0).max(1),
            None => 1024,
        };
        let backlog = match map.get("backlog") {
            Some(raw) => raw.parse::<u32>().unwrap_or(0).max(1),
            None => 5,
        };
        let db_type = DbKind::from_str(get("db_type")).unwrap_or(DbKind::Tree);

        Config {
            spool: PathBuf::from(if get("spool").is_empty() { "." } else { get("spool") }),
            pid_file: map.get("pid_file").filter(|v| !v.is_empty()).map(PathBuf::from),
            log_ident: get("log_ident").to_string(),
            log_facility: get("log_facility").to_string(),
            db_max_queue_size,
            db_type,
            backlog,
            no_login: get("no_login") == "true",
            persist_db: PathBuf::from(get("persist_db")),
            users_db: PathBuf::from(get("users_db")),
            listen: get("listen").to_string(),
        }
    }
}

/// Parses `key = value` lines, stripping `#` comments and surrounding blanks.
/// Lines without `=` are ignored.
fn parse_pairs(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        if let Some(eq) = line.find('=') {
            let key = line[..eq].trim();
            let value = line[eq + 1..].trim();
            if !key.is_empty() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }
    map
}

/// Resolves a listen address of the form `host:port`, `*:port` or bare
/// `port`. An empty or `*` host binds every interface.
pub fn parse_listen(addr: &str) -> Result<SocketAddr> {
    let (host, port) = match addr.rfind(':') {
        Some(pos) => (&addr[..pos], &addr[pos + 1..]),
        None => ("", addr),
    };

    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("bad listen port in '{addr}'")))?;

    let ip = if host.is_empty() || host == "*" {
        Ipv4Addr::UNSPECIFIED
    } else {
        host.parse::<Ipv4Addr>()
            .map_err(|_| Error::Config(format!("bad listen host in '{addr}'")))?
    };

    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}
