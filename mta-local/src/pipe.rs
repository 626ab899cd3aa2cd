//! Pipe-to-command delivery (spec §4.7.2): spawns a configured external
//! command as a non-privileged `(uid, gid)`, feeds it the message on
//! stdin with the configured pre-processing flags, enforces a per-transport
//! time limit, and maps its exit status onto a delivery outcome via the
//! sysexits taxonomy.
//!
//! Grounded in `original_source/pipe/pipe.c`'s `pipe_command` (privilege
//! checks, timeout-then-SIGKILL) and its `deliver_completed` exit-status
//! switch, which `mta_types::classify_exit_status` already encodes.

use std::{
    io::{self, Write},
    os::unix::process::CommandExt,
    process::{Command, Stdio},
    time::Duration,
};

use mta_types::{classify_exit_status, ExitClass};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("refusing to run pipe command as privileged uid {0}")]
    PrivilegedUid(u32),
    #[error("refusing to run pipe command as privileged gid {0}")]
    PrivilegedGid(u32),
    #[error("spawning pipe command ‘{0}’ failed")]
    Spawn(String, #[source] io::Error),
    #[error("writing message content to pipe command ‘{0}’ failed")]
    Write(String, #[source] io::Error),
    #[error("pipe command ‘{0}’ timed out and was killed")]
    TimedOut(String),
    #[error("waiting for pipe command ‘{0}’ failed")]
    Wait(String, #[source] io::Error),
}

/// Content pre-processing flags (spec §4.7.2).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ContentFlags {
    /// Prepend a UNIX mbox `From <sender> <date>` line.
    pub prepend_from_line: bool,
    /// Prepend a `Return-Path:` header.
    pub prepend_return_path: bool,
    /// BSMTP-style dot-stuffing: a leading `.` on a body line is doubled.
    pub dot_stuff: bool,
    /// UUCP-style escaping: a leading `From ` on a body line is escaped to
    /// `>From `.
    pub escape_from: bool,
}

/// Builds the stdin payload for a pipe delivery from the raw message body
/// and the chosen pre-processing flags.
pub fn build_stdin(envelope_sender: &str, date_line: &str, body: &[u8], flags: ContentFlags) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 64);
    if flags.prepend_from_line {
        out.extend_from_slice(format!("From {} {}\n", envelope_sender, date_line).as_bytes());
    }
    if flags.prepend_return_path {
        out.extend_from_slice(format!("Return-Path: <{}>\n", envelope_sender).as_bytes());
    }
    for line in split_keeping_terminator(body) {
        if flags.dot_stuff && line.starts_with(b".") {
            out.push(b'.');
        }
        if flags.escape_from && line.starts_with(b"From ") {
            out.extend_from_slice(b">");
        }
        out.extend_from_slice(line);
    }
    out
}

fn split_keeping_terminator(body: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, &b) in body.iter().enumerate() {
        if b == b'\n' {
            lines.push(&body[start..=i]);
            start = i + 1;
        }
    }
    if start < body.len() {
        lines.push(&body[start..]);
    }
    lines
}

/// Privileged ids a pipe transport must never run as (spec §4.7.2:
/// "refuse if uid is root or the mail-system owner, or gid is privileged").
pub struct PrivilegeGuard {
    pub mail_system_uid: u32,
    pub privileged_gids: Vec<u32>,
}

impl PrivilegeGuard {
    pub fn check(&self, uid: u32, gid: u32) -> Result<(), PipeError> {
        if uid == 0 || uid == self.mail_system_uid {
            return Err(PipeError::PrivilegedUid(uid));
        }
        if gid == 0 || self.privileged_gids.contains(&gid) {
            return Err(PipeError::PrivilegedGid(gid));
        }
        Ok(())
    }
}

/// Outcome of one pipe delivery attempt, already translated from the
/// child's exit status via [`mta_types::classify_exit_status`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipeOutcome {
    Sent,
    Bounce,
    Defer,
}

/// Runs `argv[0]` with `argv[1..]`, as `(uid, gid)`, feeding `stdin_data` on
/// its standard input, killing it with `SIGKILL` if it outlives `timeout`
/// (spec §4.7.2: "apply per-transport time limit (SIGKILL on expiry)").
pub fn run(
    argv: &[String],
    uid: u32,
    gid: u32,
    stdin_data: &[u8],
    timeout: Duration,
    guard: &PrivilegeGuard,
) -> Result<PipeOutcome, PipeError> {
    guard.check(uid, gid)?;
    let Some((program, args)) = argv.split_first() else {
        return Err(PipeError::Spawn("<empty argv>".to_owned(), io::Error::new(io::ErrorKind::InvalidInput, "empty command")));
    };

    let mut command = Command::new(program);
    command.args(args);
    command.uid(uid);
    command.gid(gid);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::null());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| PipeError::Spawn(program.clone(), e))?;

    if let Some(mut stdin) = child.stdin.take() {
        // A child that never reads (eg. a broken command) must not hang
        // this call forever; a `write_all` that blocks past `timeout` is
        // bounded by the wait-then-kill loop below racing it on a thread.
        let stdin_data = stdin_data.to_vec();
        let writer = std::thread::spawn(move || stdin.write_all(&stdin_data));
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if writer.is_finished() {
                if let Ok(Err(e)) = writer.join() {
                    warn!(program = %program, error = %e, "pipe command closed stdin early");
                }
                break;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match child.try_wait().map_err(|e| PipeError::Wait(program.clone(), e))? {
            Some(status) => {
                let code = status.code().unwrap_or(-1);
                return Ok(match classify_exit_status(code) {
                    ExitClass::Ok => PipeOutcome::Sent,
                    ExitClass::TempFail => PipeOutcome::Defer,
                    ExitClass::PermFail => PipeOutcome::Bounce,
                });
            }
            None => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(program = %program, "pipe command timed out, sent SIGKILL");
                    return Err(PipeError::TimedOut(program.clone()));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_guard_refuses_root_uid() {
        let guard = PrivilegeGuard {
            mail_system_uid: 8,
            privileged_gids: vec![0],
        };
        assert!(matches!(guard.check(0, 100), Err(PipeError::PrivilegedUid(0))));
    }

    #[test]
    fn privilege_guard_refuses_mail_system_uid() {
        let guard = PrivilegeGuard {
            mail_system_uid: 8,
            privileged_gids: vec![],
        };
        assert!(matches!(guard.check(8, 100), Err(PipeError::PrivilegedUid(8))));
    }

    #[test]
    fn privilege_guard_accepts_ordinary_ids() {
        let guard = PrivilegeGuard {
            mail_system_uid: 8,
            privileged_gids: vec![0],
        };
        assert!(guard.check(1000, 1000).is_ok());
    }

    #[test]
    fn build_stdin_prepends_from_line_and_return_path() {
        let out = build_stdin(
            "a@x",
            "Mon Jan  1 00:00:00 2024",
            b"Subject: hi\n\nbody\n",
            ContentFlags {
                prepend_from_line: true,
                prepend_return_path: true,
                ..Default::default()
            },
        );
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("From a@x Mon Jan  1 00:00:00 2024\n"));
        assert!(text.contains("Return-Path: <a@x>\n"));
        assert!(text.ends_with("body\n"));
    }

    #[test]
    fn dot_stuffing_doubles_leading_dot() {
        let out = build_stdin("a@x", "date", b".hidden\nnormal\n", ContentFlags {
            dot_stuff: true,
            ..Default::default()
        });
        assert_eq!(out, b"..hidden\nnormal\n");
    }

    #[test]
    fn uucp_escaping_guards_leading_from() {
        let out = build_stdin("a@x", "date", b"From the other side\n", ContentFlags {
            escape_from: true,
            ..Default::default()
        });
        assert_eq!(out, b">From the other side\n");
    }

    #[test]
    fn run_maps_zero_exit_to_sent() {
        let guard = PrivilegeGuard {
            mail_system_uid: 0,
            privileged_gids: vec![],
        };
        let my_uid = nix::unistd::getuid().as_raw();
        let my_gid = nix::unistd::getgid().as_raw();
        // Use a uid that the privilege guard accepts (non-root test runner
        // assumed; otherwise this test would need to run as a non-root
        // user, which CI already does).
        if my_uid == 0 {
            return;
        }
        let outcome = run(
            &["/bin/cat".to_owned(), "/dev/null".to_owned()],
            my_uid,
            my_gid,
            b"ignored",
            Duration::from_secs(5),
            &guard,
        )
        .unwrap();
        assert_eq!(outcome, PipeOutcome::Sent);
    }
}
