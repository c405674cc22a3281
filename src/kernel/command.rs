//! Control surface.
//!
//! Services manage the registry, timers and environment through a small
//! command set. Commands have a typed form ([`Command`]) and a text form
//! (`"TIMEOUT 10"`, `"REG .launcher"`, `"KILL :01000004"`) that parses into
//! it. Every command yields an optional string result; handles are printed
//! as `:` followed by eight hex digits.

use std::fmt;
use std::str::FromStr;

use super::Kernel;
use crate::types::{Error, Handle, Result};

/// Address operand: a literal handle or a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Handle(Handle),
    /// `.name` for a local alias, a bare name for a cluster-wide one.
    Name(String),
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with(':') {
            Ok(Target::Handle(s.parse()?))
        } else if s.is_empty() {
            Err(Error::validation("empty address"))
        } else {
            Ok(Target::Name(s.to_string()))
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Handle(h) => write!(f, "{}", h),
            Target::Name(n) => write!(f, "{}", n),
        }
    }
}

/// Per-service statistic read by `STAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKey {
    /// Current mailbox length.
    MailboxLen,
    /// Endless flag; reading clears it.
    Endless,
    /// Cumulative callback time in seconds.
    Cpu,
    /// Messages dispatched.
    Message,
}

impl FromStr for StatKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mqlen" => Ok(StatKey::MailboxLen),
            "endless" => Ok(StatKey::Endless),
            "cpu" => Ok(StatKey::Cpu),
            "message" => Ok(StatKey::Message),
            other => Err(Error::validation(format!("unknown STAT key: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Schedule a `RESPONSE` to the caller; returns the session.
    Timeout(i32),
    /// No name: return the caller's handle. `.name`: bind a local alias.
    /// Bare name: publish a cluster-wide name.
    Reg(Option<String>),
    Query(String),
    /// Bind `name` to an arbitrary handle.
    Name { name: String, handle: Handle },
    Exit,
    Kill(Target),
    Launch { module: String, args: String },
    GetEnv(String),
    SetEnv { key: String, value: String },
    StartTime,
    Now,
    /// Retire every service.
    Abort,
    /// Set the exit watcher, or read it when no handle is given.
    Monitor(Option<Target>),
    Stat(StatKey),
    LogOn(Target),
    LogOff(Target),
    Signal { target: Target, signal: i32 },
}

fn required<'a>(name: &str, arg: Option<&'a str>) -> Result<&'a str> {
    arg.filter(|a| !a.is_empty())
        .ok_or_else(|| Error::validation(format!("{} needs an argument", name)))
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, rest) = match s.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, Some(rest.trim())),
            None => (s, None),
        };
        let rest = rest.filter(|r| !r.is_empty());

        let cmd = match name {
            "TIMEOUT" => {
                let ticks = required(name, rest)?;
                Command::Timeout(ticks.parse().map_err(|_| {
                    Error::validation(format!("invalid TIMEOUT ticks: {}", ticks))
                })?)
            }
            "REG" => Command::Reg(rest.map(str::to_string)),
            "QUERY" => Command::Query(required(name, rest)?.to_string()),
            "NAME" => {
                let arg = required(name, rest)?;
                let (n, h) = arg
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| Error::validation("NAME needs a name and a handle"))?;
                Command::Name {
                    name: n.to_string(),
                    handle: h.trim().parse()?,
                }
            }
            "EXIT" => Command::Exit,
            "KILL" => Command::Kill(required(name, rest)?.parse()?),
            "LAUNCH" => {
                let arg = required(name, rest)?;
                let (module, args) = match arg.split_once(char::is_whitespace) {
                    Some((module, args)) => (module, args.trim()),
                    None => (arg, ""),
                };
                Command::Launch {
                    module: module.to_string(),
                    args: args.to_string(),
                }
            }
            "GETENV" => Command::GetEnv(required(name, rest)?.to_string()),
            "SETENV" => {
                let arg = required(name, rest)?;
                let (key, value) = arg
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| Error::validation("SETENV needs a key and a value"))?;
                Command::SetEnv {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                }
            }
            "STARTTIME" => Command::StartTime,
            "NOW" => Command::Now,
            "ABORT" => Command::Abort,
            "MONITOR" => Command::Monitor(rest.map(str::parse).transpose()?),
            "STAT" => Command::Stat(required(name, rest)?.parse()?),
            "LOGON" => Command::LogOn(required(name, rest)?.parse()?),
            "LOGOFF" => Command::LogOff(required(name, rest)?.parse()?),
            "SIGNAL" => {
                let arg = required(name, rest)?;
                let (target, signal) = match arg.split_once(char::is_whitespace) {
                    Some((target, signal)) => (
                        target,
                        signal.trim().parse().map_err(|_| {
                            Error::validation(format!("invalid signal: {}", signal))
                        })?,
                    ),
                    None => (arg, 0),
                };
                Command::Signal {
                    target: target.parse()?,
                    signal,
                }
            }
            other => return Err(Error::validation(format!("unknown command: {}", other))),
        };
        Ok(cmd)
    }
}

impl Kernel {
    /// Resolve an address operand to a handle.
    pub fn resolve(&self, target: &Target) -> Option<Handle> {
        match target {
            Target::Handle(h) => Some(*h),
            Target::Name(name) => self.query_name(name),
        }
    }

    fn resolve_or_not_found(&self, target: &Target) -> Result<Handle> {
        self.resolve(target)
            .ok_or_else(|| Error::not_found(format!("no service at {}", target)))
    }

    /// Run `cmd` on behalf of `caller`.
    pub fn command(&self, caller: Handle, cmd: Command) -> Result<Option<String>> {
        match cmd {
            Command::Timeout(ticks) => {
                let cell = self
                    .registry
                    .grab(caller)
                    .ok_or_else(|| Error::not_found(format!("no service at {}", caller)))?;
                let session = cell.new_session();
                drop(cell);
                let session = self
                    .timeout(caller, ticks, session)
                    .ok_or_else(|| Error::delivery("timeout could not be delivered"))?;
                Ok(Some(session.to_string()))
            }
            Command::Reg(None) => Ok(Some(caller.to_string())),
            Command::Reg(Some(name)) => self.bind_name(caller, &name).map(Some),
            Command::Query(name) => self
                .query_name(&name)
                .map(|h| Some(h.to_string()))
                .ok_or_else(|| Error::not_found(format!("name not found: {}", name))),
            Command::Name { name, handle } => self.bind_name(handle, &name).map(Some),
            Command::Exit => {
                self.retire(caller);
                Ok(None)
            }
            Command::Kill(target) => {
                let handle = self.resolve_or_not_found(&target)?;
                if !self.retire(handle) {
                    return Err(Error::not_found(format!("no service at {}", handle)));
                }
                Ok(None)
            }
            Command::Launch { module, args } => self
                .launch(&module, &args)
                .map(|h| Some(h.to_string()))
                .ok_or_else(|| Error::validation(format!("launch {} {} failed", module, args))),
            Command::GetEnv(key) => Ok(self.env.get(&key)),
            Command::SetEnv { key, value } => {
                self.env.set(&key, &value)?;
                Ok(None)
            }
            Command::StartTime => Ok(Some(self.timer.start_time().timestamp().to_string())),
            Command::Now => Ok(Some(self.timer.now().to_string())),
            Command::Abort => {
                self.abort();
                Ok(None)
            }
            Command::Monitor(None) => Ok(self.exit_watcher().map(|h| h.to_string())),
            Command::Monitor(Some(target)) => {
                let handle = self.resolve_or_not_found(&target)?;
                self.set_exit_watcher(handle);
                Ok(None)
            }
            Command::Stat(key) => {
                let cell = self
                    .registry
                    .grab(caller)
                    .ok_or_else(|| Error::not_found(format!("no service at {}", caller)))?;
                let value = match key {
                    StatKey::MailboxLen => cell.mailbox.len().to_string(),
                    StatKey::Endless => u8::from(cell.take_endless()).to_string(),
                    StatKey::Cpu => format!("{:.6}", cell.cpu_cost().as_secs_f64()),
                    StatKey::Message => cell.message_count().to_string(),
                };
                Ok(Some(value))
            }
            Command::LogOn(target) => {
                self.set_trace(&target, true)?;
                Ok(None)
            }
            Command::LogOff(target) => {
                self.set_trace(&target, false)?;
                Ok(None)
            }
            Command::Signal { target, signal } => {
                let handle = self.resolve_or_not_found(&target)?;
                if handle == caller {
                    return Err(Error::validation("a service cannot signal itself"));
                }
                let cell = self
                    .registry
                    .grab(handle)
                    .ok_or_else(|| Error::not_found(format!("no service at {}", handle)))?;
                self.signal_service(&cell, signal)?;
                Ok(None)
            }
        }
    }
}

impl Kernel {
    fn set_trace(&self, target: &Target, on: bool) -> Result<()> {
        let handle = self.resolve_or_not_found(target)?;
        let cell = self
            .registry
            .grab(handle)
            .ok_or_else(|| Error::not_found(format!("no service at {}", handle)))?;
        cell.set_trace(on);
        tracing::info!(handle = %handle, on, "message trace toggled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!("TIMEOUT 10".parse::<Command>().unwrap(), Command::Timeout(10));
        assert_eq!("REG".parse::<Command>().unwrap(), Command::Reg(None));
        assert_eq!(
            "REG .launcher".parse::<Command>().unwrap(),
            Command::Reg(Some(".launcher".to_string()))
        );
        assert_eq!("EXIT".parse::<Command>().unwrap(), Command::Exit);
        assert_eq!("NOW".parse::<Command>().unwrap(), Command::Now);
        assert_eq!("MONITOR".parse::<Command>().unwrap(), Command::Monitor(None));
        assert_eq!(
            "STAT mqlen".parse::<Command>().unwrap(),
            Command::Stat(StatKey::MailboxLen)
        );
    }

    #[test]
    fn test_parse_commands_with_operands() {
        assert_eq!(
            "KILL :01000004".parse::<Command>().unwrap(),
            Command::Kill(Target::Handle(Handle::new(1, 4)))
        );
        assert_eq!(
            "KILL .db".parse::<Command>().unwrap(),
            Command::Kill(Target::Name(".db".to_string()))
        );
        assert_eq!(
            "NAME .db :00000002".parse::<Command>().unwrap(),
            Command::Name {
                name: ".db".to_string(),
                handle: Handle::new(0, 2)
            }
        );
        assert_eq!(
            "LAUNCH logger  extra args here".parse::<Command>().unwrap(),
            Command::Launch {
                module: "logger".to_string(),
                args: "extra args here".to_string()
            }
        );
        assert_eq!(
            "SETENV start main loop".parse::<Command>().unwrap(),
            Command::SetEnv {
                key: "start".to_string(),
                value: "main loop".to_string()
            }
        );
        assert_eq!(
            "SIGNAL :00000003 2".parse::<Command>().unwrap(),
            Command::Signal {
                target: Target::Handle(Handle::new(0, 3)),
                signal: 2
            }
        );
        assert_eq!(
            "SIGNAL :00000003".parse::<Command>().unwrap(),
            Command::Signal {
                target: Target::Handle(Handle::new(0, 3)),
                signal: 0
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("BOGUS".parse::<Command>().is_err());
        assert!("TIMEOUT".parse::<Command>().is_err());
        assert!("TIMEOUT soon".parse::<Command>().is_err());
        assert!("STAT heap".parse::<Command>().is_err());
        assert!("KILL :zz".parse::<Command>().is_err());
        assert!("SETENV lonely".parse::<Command>().is_err());
        let err = "QUERY".parse::<Command>().unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }
}
