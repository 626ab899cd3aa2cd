//! Local delivery agent (spec §4.7): the per-recipient pipeline run once a
//! message has been routed to the `local` transport by the queue manager.
//!
//! Each recipient passes through, in order: the duplicate filter (step 1),
//! alias expansion (step 2, `alias` module), forward/include-file expansion
//! for any destination that names one (step 3, `include_file` module), and
//! finally terminal delivery to one of a pipe command (`pipe` module), a
//! mailbox file (`mailbox` module), or -- left to the caller, since this
//! crate does not speak the maildir format -- some other configured
//! transport. Argv macro substitution for pipe destinations is handled by
//! `macro_expand`.

pub mod alias;
pub mod dup_filter;
pub mod include_file;
pub mod macro_expand;
pub mod mailbox;
pub mod pipe;

use std::path::PathBuf;

use tracing::{info, instrument, warn};

use alias::{AliasError, AliasTable, Destination};
use dup_filter::{DeliveryKey, DuplicateFilter};
use include_file::IncludeError;
use mailbox::{DeliveryIdentity, MailboxError, WriteOutcome};
use pipe::{PipeError, PipeOutcome};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Alias(#[from] AliasError),
    #[error(transparent)]
    Include(#[from] IncludeError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Pipe(#[from] PipeError),
    #[error("recipient ‘{0}’ has no resolvable destination (unknown user, no mailbox path)")]
    UnknownRecipient(String),
}

/// What happened to one recipient after the whole pipeline ran (spec
/// §4.7: the agent reports one of these three outcomes per recipient back
/// to the queue manager).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Delivered,
    Deferred,
    Bounced,
}

impl From<WriteOutcome> for Outcome {
    fn from(w: WriteOutcome) -> Outcome {
        match w {
            WriteOutcome::Defer => Outcome::Deferred,
            WriteOutcome::Bounce => Outcome::Bounced,
        }
    }
}

impl From<PipeOutcome> for Outcome {
    fn from(p: PipeOutcome) -> Outcome {
        match p {
            PipeOutcome::Sent => Outcome::Delivered,
            PipeOutcome::Defer => Outcome::Deferred,
            PipeOutcome::Bounce => Outcome::Bounced,
        }
    }
}

/// Per-recipient account information the dispatch flow needs once alias
/// expansion has settled on a plain address (spec §4.7: mailbox location,
/// owning uid/gid, and whether that mailbox lives under the recipient's
/// home directory).
#[derive(Clone, Debug)]
pub struct Account {
    pub uid: u32,
    pub gid: u32,
    pub mailbox_path: PathBuf,
    pub is_home_mailbox: bool,
    pub spool_dir: Option<PathBuf>,
}

/// Looks up a plain local user name; returns `None` for unknown users so
/// the caller can bounce with "unknown recipient" rather than erroring out
/// of the whole expansion.
pub trait AccountLookup {
    fn lookup(&self, user: &str) -> Option<Account>;
}

/// Configuration for the local delivery agent: the alias table, the account
/// directory, whether the alias database is root-owned (gates the
/// privilege-drop-around-the-read in `include_file`), and the mailbox
/// dotlock policy.
pub struct Config<'a, L: AccountLookup> {
    pub aliases: &'a AliasTable,
    pub accounts: &'a L,
    pub alias_db_is_root_owned: bool,
    pub dotlock: bool,
}

/// Delivers one envelope recipient end to end: duplicate filter, alias
/// expansion, forward/include-file expansion, and terminal delivery,
/// returning one [`Outcome`] per terminal destination the recipient
/// expanded into (a list alias fans a single recipient out to many).
#[instrument(skip(config, dup_filter, content), fields(recipient = %recipient))]
pub fn deliver_recipient<L: AccountLookup>(
    recipient: &str,
    content: &[u8],
    config: &Config<'_, L>,
    dup_filter: &mut DuplicateFilter,
) -> Result<Vec<(String, Outcome)>, DeliveryError> {
    let destinations = match config.aliases.expand(recipient)? {
        Some(expansion) => expansion.destinations,
        None => vec![Destination::Address(recipient.to_owned())],
    };

    let mut results = Vec::new();
    for destination in expand_includes(destinations, config)? {
        let outcome = deliver_one(recipient, &destination, content, config, dup_filter)?;
        let label = match &destination {
            Destination::Address(a) => a.clone(),
            Destination::Include(p) => p.clone(),
            Destination::Command(c) => c.clone(),
        };
        results.push((label, outcome));
    }
    Ok(results)
}

/// Expands any `Destination::Include` entries into the addresses their
/// file lists, leaving `Address`/`Command` destinations untouched (spec
/// §4.7 step 3).
fn expand_includes<L: AccountLookup>(
    destinations: Vec<Destination>,
    config: &Config<'_, L>,
) -> Result<Vec<Destination>, DeliveryError> {
    let mut out = Vec::with_capacity(destinations.len());
    for dest in destinations {
        match dest {
            Destination::Include(path) => {
                let path_buf = PathBuf::from(&path);
                let contents = include_file::read_as_owner(&path_buf, config.alias_db_is_root_owned)?;
                for addr in include_file::parse_include_list(&contents) {
                    out.push(Destination::Address(addr));
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn deliver_one<L: AccountLookup>(
    recipient: &str,
    destination: &Destination,
    content: &[u8],
    config: &Config<'_, L>,
    dup_filter: &mut DuplicateFilter,
) -> Result<Outcome, DeliveryError> {
    match destination {
        Destination::Command(command_line) => {
            let key = DeliveryKey::MailboxUser(command_line.clone(), recipient.to_owned());
            if !dup_filter.check_and_insert(key) {
                info!(command = %command_line, "duplicate pipe destination suppressed");
                return Ok(Outcome::Delivered);
            }
            // Argv splitting and uid/gid/timeout resolution are transport
            // configuration the caller already holds; this crate only owns
            // the mechanics of running the command once a concrete argv,
            // uid, gid, and timeout have been chosen. Plain whitespace
            // split here covers the common case of simple pipe commands.
            let argv: Vec<String> = command_line.split_whitespace().map(str::to_owned).collect();
            let account = config
                .accounts
                .lookup(recipient)
                .ok_or_else(|| DeliveryError::UnknownRecipient(recipient.to_owned()))?;
            let guard = pipe::PrivilegeGuard {
                mail_system_uid: 0,
                privileged_gids: vec![0],
            };
            let outcome = pipe::run(
                &argv,
                account.uid,
                account.gid,
                content,
                std::time::Duration::from_secs(3600),
                &guard,
            )?;
            Ok(outcome.into())
        }
        Destination::Address(addr) => {
            let account = config
                .accounts
                .lookup(addr)
                .ok_or_else(|| DeliveryError::UnknownRecipient(addr.clone()))?;

            let key = DeliveryKey::UidPath(account.uid, account.mailbox_path.display().to_string());
            if !dup_filter.check_and_insert(key) {
                info!(mailbox = %account.mailbox_path.display(), "duplicate mailbox destination suppressed");
                return Ok(Outcome::Delivered);
            }

            let identity = mailbox::choose_identity(
                account.is_home_mailbox,
                account.spool_dir.as_deref(),
                account.uid,
                account.gid,
            )?;
            match mailbox::deliver(&account.mailbox_path, identity, content, config.dotlock) {
                Ok(()) => Ok(Outcome::Delivered),
                Err(e) => {
                    let outcome = e.write_outcome();
                    warn!(mailbox = %account.mailbox_path.display(), error = %e, ?outcome, "mailbox delivery failed");
                    Ok(outcome.into())
                }
            }
        }
        Destination::Include(_) => unreachable!("includes are expanded before deliver_one runs"),
    }
}
