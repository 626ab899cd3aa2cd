//! Sendmail-compatible multi-call CLI binary (spec §6): the single
//! end-user-facing surface over the store-and-forward core. Submits mail
//! (`sendmail`), lists the queue (`mailq`), reloads the address-mapping
//! tables (`newaliases`), nudges the Queue Manager (`-q`/`-qR`), runs one
//! SMTP session on stdio (`-bs`), or runs the process Supervisor.
//!
//! Argv handling follows the historical sendmail convention of dispatching
//! on `argv[0]`'s basename for the `mailq`/`newaliases` aliases, the way
//! every real sendmail-family MTA installs those as symlinks to the same
//! binary.

use std::{
    io::{self, Read, Write},
    path::PathBuf,
};

use anyhow::Context;
use tracing::{info, warn};

use mta_queue::QueueRoot;
use mta_trigger::{Endpoint, Trigger};
use mta_types::ExitClass;

pub mod bs;
pub mod opt;

pub use opt::Opt;

/// `MAIL_CONFIG` doubles, in this minimal non-goal-scoped configuration
/// surface, as the queue root directory -- there is no general
/// configuration language (spec §1's explicit non-goal), so the one path a
/// deployment must supply is where the queues live.
pub fn queue_dir_from_env() -> PathBuf {
    std::env::var_os("MAIL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/spool/mta"))
}

pub fn trigger_path_from_env(queue_dir: &std::path::Path) -> PathBuf {
    queue_dir.join("qmgr-trigger")
}

/// Process-exit codes the binary as a whole returns, mirroring the
/// sysexits taxonomy `mta_types::classify_exit_status` already encodes for
/// child delivery agents (spec §6's CLI is subject to the same taxonomy).
pub const EX_OK: i32 = 0;
pub const EX_USAGE: i32 = 64;
pub const EX_DATAERR: i32 = 65;
pub const EX_UNAVAILABLE: i32 = 69;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_OSERR: i32 = 71;
pub const EX_TEMPFAIL: i32 = 75;

/// Normalizes historical single-dash, multi-letter sendmail flags
/// (`-bp`, `-bi`, `-bs`, bare `-q`, `-qRsite`) into the long-form flags
/// [`Opt`] declares, since clap/structopt only recognizes single-character
/// short options. A small hand-rolled rewrite, in the same spirit as
/// `mta-supervisor::config`'s hand-rolled service-line splitter -- this
/// grammar is a handful of fixed prefixes, not worth a parser dependency.
pub fn normalize_argv(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-bp" => out.push("--mailq".to_owned()),
            "-bi" => out.push("--newaliases".to_owned()),
            "-bs" => out.push("--stdin-smtp".to_owned()),
            "-q" => out.push("--queue-flush".to_owned()),
            _ if arg.starts_with("-qR") => {
                out.push("--flush-site".to_owned());
                out.push(arg["-qR".len()..].to_owned());
            }
            _ if arg.starts_with("-f") && arg.len() > 2 => {
                out.push("--from".to_owned());
                out.push(arg["-f".len()..].to_owned());
            }
            _ if arg.starts_with("-F") && arg.len() > 2 => {
                out.push("--full-name".to_owned());
                out.push(arg["-F".len()..].to_owned());
            }
            other => out.push(other.to_owned()),
        }
    }
    out
}

/// The name-basis dispatch of a multi-call binary (spec §6: `mailq` and
/// `newaliases` are themselves complete invocations, historically
/// installed as symlinks to the `sendmail` binary).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallAs {
    Sendmail,
    MailQ,
    NewAliases,
}

pub fn call_as(argv0: &str) -> CallAs {
    let basename = argv0.rsplit('/').next().unwrap_or(argv0);
    match basename {
        "mailq" => CallAs::MailQ,
        "newaliases" => CallAs::NewAliases,
        _ => CallAs::Sendmail,
    }
}

/// Submits one message read from stdin through Cleanup, then best-effort
/// nudges the Queue Manager (spec §4.2/§4.3).
pub fn submit(opt: &Opt, queue: &QueueRoot, trigger: Option<&Endpoint>) -> anyhow::Result<i32> {
    let mut content = Vec::new();
    io::stdin()
        .read_to_end(&mut content)
        .context("reading message from stdin")?;

    let recipients = if opt.read_recipients_from_headers {
        recipients_from_headers(&content)
    } else {
        opt.recipients.clone()
    };
    if recipients.is_empty() {
        eprintln!("no recipients supplied (pass them as arguments, or -t to read message headers)");
        return Ok(EX_USAGE);
    }

    let submission = mta_cleanup::Submission {
        sender: opt.from.clone(),
        sender_full_name: opt.full_name.clone(),
        recipients,
        content,
    };
    let mut ctx = mta_cleanup::CleanupContext::new(&[], &[]);

    match mta_cleanup::process(&mut ctx, &submission, queue, trigger) {
        Ok(id) => {
            info!(id = %id, "message accepted into the queue");
            Ok(EX_OK)
        }
        Err(mta_cleanup::CleanupError::Rejected(reason)) => {
            eprintln!("submission rejected: {}", reason);
            Ok(EX_DATAERR)
        }
        Err(e) => {
            eprintln!("submission failed: {}", e);
            Ok(EX_OSERR)
        }
    }
}

/// Crude `To:`/`Cc:`/`Bcc:` header scan for `-t` (spec §6): reads the
/// unfolded header block up to the first blank line and splits each
/// address header's value on commas. Full RFC 5322 header folding and
/// comment handling is left to Cleanup's own address rewriting pass; this
/// only needs to find candidate recipient strings.
fn recipients_from_headers(content: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(content);
    let header_block = text.split("\r\n\r\n").next().unwrap_or(&text);
    let header_block = header_block.split("\n\n").next().unwrap_or(header_block);

    let mut recipients = Vec::new();
    let mut current: Option<String> = None;
    for line in header_block.lines() {
        if line.starts_with(|c: char| c.is_whitespace()) {
            if let Some(buf) = current.as_mut() {
                buf.push(' ');
                buf.push_str(line.trim());
            }
            continue;
        }
        if let Some(buf) = current.take() {
            push_header_if_recipient(&mut recipients, &buf);
        }
        current = Some(line.to_owned());
    }
    if let Some(buf) = current {
        push_header_if_recipient(&mut recipients, &buf);
    }
    recipients
}

fn push_header_if_recipient(recipients: &mut Vec<String>, line: &str) {
    let Some((name, value)) = line.split_once(':') else {
        return;
    };
    if matches!(name.trim().to_ascii_lowercase().as_str(), "to" | "cc" | "bcc") {
        recipients.extend(value.split(',').map(|a| a.trim().to_owned()).filter(|a| !a.is_empty()));
    }
}

/// `mailq`/`sendmail -bp` (spec §6): a one-line-per-message listing of
/// every queue file in `incoming`, `active`, and `deferred`.
pub fn mailq(queue: &QueueRoot) -> anyhow::Result<i32> {
    use mta_types::{QueueDir, RecordType};

    let mut printed_any = false;
    for dir in [QueueDir::Incoming, QueueDir::Active, QueueDir::Deferred] {
        for id in queue.scan(dir).context("scanning queue directory")? {
            let Ok(mut reader) = queue.open(dir, &id, false) else {
                continue;
            };
            let mut size = None;
            let mut sender = None;
            let mut pending_rcpts = 0usize;
            for record in reader.records().flatten() {
                match record.ty {
                    RecordType::Size if record.payload.len() == 8 => {
                        let bytes: [u8; 8] = record.payload[..8].try_into().unwrap();
                        size = Some(u64::from_le_bytes(bytes));
                    }
                    RecordType::From => {
                        sender = Some(String::from_utf8_lossy(&record.payload).into_owned());
                    }
                    RecordType::Rcpt => pending_rcpts += 1,
                    _ => {}
                }
            }
            println!(
                "{:<16} {:>10} {:<4} {} -> {} pending recipient(s)",
                id.as_str(),
                size.unwrap_or(0),
                dir,
                sender.unwrap_or_default(),
                pending_rcpts,
            );
            printed_any = true;
        }
    }
    if !printed_any {
        println!("Mail queue is empty");
    }
    Ok(EX_OK)
}

/// `newaliases`/`sendmail -bi` (spec §6): reloads and validates the
/// one-to-many address mapping table from `path`, reporting how many
/// entries parsed.
pub fn newaliases(path: &std::path::Path) -> anyhow::Result<i32> {
    match mta_cleanup::lookup::FileTable::load(path.display().to_string(), path) {
        Ok(table) => {
            println!("{}: {} aliases", path.display(), table.len());
            Ok(EX_OK)
        }
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            Ok(EX_UNAVAILABLE)
        }
    }
}

/// `sendmail -q` / `sendmail -qRsite` (spec §6): best-effort wakeup of the
/// Queue Manager, either a full rescan or a single site's deferred queue.
pub fn queue_flush(trigger: &Endpoint, site: Option<&str>) -> i32 {
    match site {
        Some(site) => {
            let mut payload = vec![Trigger::FlushSite.as_byte()];
            payload.extend_from_slice(site.as_bytes());
            trigger.send_bytes(&payload);
        }
        None => trigger.send(Trigger::ScanAll),
    }
    EX_OK
}

/// Maps an [`ExitClass`] (already computed for some upstream failure) onto
/// this binary's own process exit status.
pub fn exit_code_for(class: ExitClass) -> i32 {
    match class {
        ExitClass::Ok => EX_OK,
        ExitClass::TempFail => EX_TEMPFAIL,
        ExitClass::PermFail => EX_DATAERR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rewrites_historical_short_flags() {
        let out = normalize_argv(
            ["sendmail", "-bp"].iter().map(|s| s.to_string()),
        );
        assert_eq!(out, vec!["sendmail".to_owned(), "--mailq".to_owned()]);
    }

    #[test]
    fn normalize_splits_attached_flush_site() {
        let out = normalize_argv(["-qRexample.com"].iter().map(|s| s.to_string()));
        assert_eq!(out, vec!["--flush-site".to_owned(), "example.com".to_owned()]);
    }

    #[test]
    fn normalize_splits_attached_sender() {
        let out = normalize_argv(["-falice@example.com"].iter().map(|s| s.to_string()));
        assert_eq!(out, vec!["--from".to_owned(), "alice@example.com".to_owned()]);
    }

    #[test]
    fn normalize_leaves_bare_q_and_unrelated_args_alone() {
        let out = normalize_argv(["-q", "-i", "bob@x"].iter().map(|s| s.to_string()));
        assert_eq!(out, vec!["--queue-flush".to_owned(), "-i".to_owned(), "bob@x".to_owned()]);
    }

    #[test]
    fn call_as_detects_mailq_and_newaliases_by_basename() {
        assert_eq!(call_as("/usr/sbin/mailq"), CallAs::MailQ);
        assert_eq!(call_as("newaliases"), CallAs::NewAliases);
        assert_eq!(call_as("/usr/sbin/sendmail"), CallAs::Sendmail);
    }

    #[test]
    fn recipients_from_headers_collects_to_and_cc() {
        let msg = b"From: a@x\r\nTo: b@x, c@x\r\nCc: d@x\r\nSubject: hi\r\n\r\nbody\r\n";
        let recipients = recipients_from_headers(msg);
        assert_eq!(recipients, vec!["b@x".to_owned(), "c@x".to_owned(), "d@x".to_owned()]);
    }

    #[test]
    fn recipients_from_headers_handles_folded_lines() {
        let msg = b"To: b@x,\r\n c@x\r\n\r\nbody\r\n";
        let recipients = recipients_from_headers(msg);
        assert_eq!(recipients, vec!["b@x".to_owned(), "c@x".to_owned()]);
    }

    #[test]
    fn mailq_reports_empty_queue() {
        let dir = tempdir::TempDir::new("mta-cli").unwrap();
        let queue = QueueRoot::new(dir.path(), false).unwrap();
        assert_eq!(mailq(&queue).unwrap(), EX_OK);
    }
}
