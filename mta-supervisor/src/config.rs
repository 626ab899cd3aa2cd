//! Supervisor configuration file format (spec §6): one line per service,
//! `name type private unpriv chroot wakeup maxproc command [args...]`.

use std::{collections::HashMap, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("line {0}: expected at least 8 fields, got {1}")]
    TooFewFields(usize, usize),
    #[error("line {0}: invalid boolean field ‘{1}’")]
    InvalidBool(usize, String),
    #[error("line {0}: invalid integer field ‘{1}’")]
    InvalidInt(usize, String),
    #[error("line {0}: unknown transport ‘{1}’")]
    UnknownTransport(usize, String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Unix,
    Inet,
    Fifo,
}

impl Transport {
    fn parse(s: &str) -> Option<Transport> {
        match s {
            "unix" => Some(Transport::Unix),
            "inet" => Some(Transport::Inet),
            "fifo" => Some(Transport::Fifo),
            _ => None,
        }
    }
}

/// One configured service (spec §4.4): "`{name, endpoint, transport
/// (unix/inet/fifo), process_limit, max_use, throttle_deadline,
/// live_children: set<pid>}`" -- the static fields live here, the dynamic
/// ones (`throttle_deadline`, `live_children`) in [`crate::ServiceRuntime`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub transport: Transport,
    pub private: bool,
    pub unpriv: bool,
    pub chroot: bool,
    pub wakeup: Option<Duration>,
    pub max_proc: u32,
    pub command: String,
    pub args: Vec<String>,
}

impl ServiceConfig {
    fn parse_line(lineno: usize, line: &str) -> Result<ServiceConfig, ConfigError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(ConfigError::TooFewFields(lineno, fields.len()));
        }
        let name = fields[0].to_owned();
        let transport =
            Transport::parse(fields[1]).ok_or_else(|| ConfigError::UnknownTransport(lineno, fields[1].to_owned()))?;
        let private = parse_bool(lineno, fields[2])?;
        let unpriv = parse_bool(lineno, fields[3])?;
        let chroot = parse_bool(lineno, fields[4])?;
        let wakeup = parse_wakeup(lineno, fields[5])?;
        let max_proc = parse_u32(lineno, fields[6])?;
        let command = fields[7].to_owned();
        let args = fields[8..].iter().map(|s| s.to_string()).collect();
        Ok(ServiceConfig {
            name,
            transport,
            private,
            unpriv,
            chroot,
            wakeup,
            max_proc,
            command,
            args,
        })
    }
}

fn parse_bool(lineno: usize, s: &str) -> Result<bool, ConfigError> {
    match s {
        "y" | "yes" | "true" => Ok(true),
        "n" | "no" | "false" | "-" => Ok(false),
        _ => Err(ConfigError::InvalidBool(lineno, s.to_owned())),
    }
}

fn parse_u32(lineno: usize, s: &str) -> Result<u32, ConfigError> {
    s.parse().map_err(|_| ConfigError::InvalidInt(lineno, s.to_owned()))
}

fn parse_wakeup(lineno: usize, s: &str) -> Result<Option<Duration>, ConfigError> {
    if s == "-" || s == "0" {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs(parse_u32(lineno, s)? as u64)))
}

/// An immutable snapshot of the whole service table, swapped atomically on
/// SIGHUP (spec §9: "the supervisor's configuration dictionary becomes an
/// immutable snapshot replaced atomically on SIGHUP").
#[derive(Clone, Debug, Default)]
pub struct ServiceTable {
    pub services: HashMap<String, ServiceConfig>,
}

impl ServiceTable {
    pub fn parse(text: &str) -> Result<ServiceTable, ConfigError> {
        let mut services = HashMap::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let svc = ServiceConfig::parse_line(i + 1, line)?;
            services.insert(svc.name.clone(), svc);
        }
        Ok(ServiceTable { services })
    }

    /// Names present in `self` but not in `new` -- these transition to
    /// Retired on reload (spec §4.4).
    pub fn removed_since<'a>(&'a self, new: &ServiceTable) -> impl Iterator<Item = &'a str> {
        self.services
            .keys()
            .filter(move |name| !new.services.contains_key(*name))
            .map(|s| s.as_str())
    }
}
