//! Mailbox file delivery (spec §4.7.1): least-privilege UNIX mbox writes,
//! chosen between four ownership cases depending on the destination's
//! location and permissions, locked with a kernel advisory lock combined
//! with dot-locking when configured.
//!
//! Grounded in `original_source/src/local/mailbox.c`'s
//! `mailbox_lock_file`/`deliver_mailbox_file` ordering: stat the
//! destination *before* opening it for write, refuse anything with an
//! execute bit (a script, not a mailbox), then open `O_APPEND | O_CREAT`
//! under whichever uid/gid the four cases below select.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt},
    path::Path,
    time::Duration,
};

use fs2::FileExt;
use nix::unistd::{Gid, Uid};

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("stat of mailbox ‘{0}’ failed")]
    Stat(String, #[source] io::Error),
    #[error("destination ‘{0}’ is not a regular file")]
    NotRegularFile(String),
    #[error("destination ‘{0}’ has an execute bit set")]
    ExecutableDestination(String),
    #[error("dropping privilege for mailbox ‘{0}’ failed")]
    Privilege(String, #[source] nix::Error),
    #[error("opening mailbox ‘{0}’ failed")]
    Open(String, #[source] io::Error),
    #[error("locking mailbox ‘{0}’ failed")]
    Lock(String, #[source] io::Error),
    #[error("writing mailbox ‘{0}’ failed")]
    Write(String, #[source] io::Error),
    #[error("chown of mailbox ‘{0}’ failed")]
    Chown(String, #[source] nix::Error),
}

/// The outcome a failed write maps onto (spec §4.7.1: "on write failure
/// with `EAGAIN`/`ENOSPC` -> defer; otherwise -> bounce").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Defer,
    Bounce,
}

impl MailboxError {
    pub fn write_outcome(&self) -> WriteOutcome {
        match self {
            MailboxError::Write(_, e) => match e.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ENOSPC) => WriteOutcome::Defer,
                _ => WriteOutcome::Bounce,
            },
            MailboxError::ExecutableDestination(_) | MailboxError::NotRegularFile(_) => {
                WriteOutcome::Bounce
            }
            _ => WriteOutcome::Defer,
        }
    }
}

/// Which of the four least-privilege cases applies to a destination path
/// (spec §4.7.1): determined by whether the mailbox lives under the
/// recipient's home directory or under a shared spool, and the spool's
/// permission bits, when it's the latter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryIdentity {
    /// Home mailbox: open/lock as the recipient.
    AsRecipient { uid: u32, gid: u32 },
    /// World-writable spool: still just the recipient's own uid/gid.
    SpoolWorldWritable { uid: u32, gid: u32 },
    /// Group-writable spool: recipient uid, but the spool's group.
    SpoolGroupWritable { uid: u32, spool_gid: u32 },
    /// Neither: write as root (the caller's current privilege), then chown
    /// to the recipient afterwards.
    RootThenChown { uid: u32, gid: u32 },
}

/// Chooses the delivery identity for `spool_dir` (spec §4.7.1's four
/// cases), given the recipient's uid/gid and whether the mailbox is a home
/// mailbox (not under a shared spool at all).
pub fn choose_identity(
    is_home_mailbox: bool,
    spool_dir: Option<&Path>,
    recipient_uid: u32,
    recipient_gid: u32,
) -> Result<DeliveryIdentity, MailboxError> {
    if is_home_mailbox {
        return Ok(DeliveryIdentity::AsRecipient {
            uid: recipient_uid,
            gid: recipient_gid,
        });
    }
    let Some(spool_dir) = spool_dir else {
        return Ok(DeliveryIdentity::RootThenChown {
            uid: recipient_uid,
            gid: recipient_gid,
        });
    };
    let meta = fs::metadata(spool_dir)
        .map_err(|e| MailboxError::Stat(spool_dir.display().to_string(), e))?;
    let mode = meta.permissions().mode();
    if mode & 0o002 != 0 {
        Ok(DeliveryIdentity::SpoolWorldWritable {
            uid: recipient_uid,
            gid: recipient_gid,
        })
    } else if mode & 0o020 != 0 {
        Ok(DeliveryIdentity::SpoolGroupWritable {
            uid: recipient_uid,
            spool_gid: meta.gid(),
        })
    } else {
        Ok(DeliveryIdentity::RootThenChown {
            uid: recipient_uid,
            gid: recipient_gid,
        })
    }
}

/// Writes `content` to the mbox file at `path`, under the given identity,
/// with the locking discipline spec §4.7.1 mandates: a kernel advisory
/// `flock`, plus a `.lock` dotfile alongside when `dotlock` is set. Destined
/// pre-write `fstat` rejects anything that isn't a plain file or that has
/// any execute bit (a defence against delivering mail into a script).
pub fn deliver(
    path: &Path,
    identity: DeliveryIdentity,
    content: &[u8],
    dotlock: bool,
) -> Result<(), MailboxError> {
    let path_str = path.display().to_string();

    let saved_euid = nix::unistd::geteuid();
    let saved_egid = nix::unistd::getegid();
    let drop_privilege = !matches!(identity, DeliveryIdentity::RootThenChown { .. });
    if drop_privilege {
        let (uid, gid) = match identity {
            DeliveryIdentity::AsRecipient { uid, gid }
            | DeliveryIdentity::SpoolWorldWritable { uid, gid } => (uid, gid),
            DeliveryIdentity::SpoolGroupWritable { uid, spool_gid } => (uid, spool_gid),
            DeliveryIdentity::RootThenChown { .. } => unreachable!(),
        };
        nix::unistd::setegid(Gid::from_raw(gid)).map_err(|e| MailboxError::Privilege(path_str.clone(), e))?;
        nix::unistd::seteuid(Uid::from_raw(uid)).map_err(|e| MailboxError::Privilege(path_str.clone(), e))?;
    }

    let result = deliver_at_current_privilege(path, content, dotlock);

    if drop_privilege {
        let _ = nix::unistd::seteuid(saved_euid);
        let _ = nix::unistd::setegid(saved_egid);
    }

    let result = result?;

    if let DeliveryIdentity::RootThenChown { uid, gid } = identity {
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|e| MailboxError::Chown(path_str, e))?;
    }
    Ok(result)
}

fn deliver_at_current_privilege(path: &Path, content: &[u8], dotlock: bool) -> Result<(), MailboxError> {
    let path_str = path.display().to_string();

    let dotlock_guard = if dotlock {
        Some(acquire_dotlock(path)?)
    } else {
        None
    };

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| MailboxError::Open(path_str.clone(), e))?;

    file.lock_exclusive()
        .map_err(|e| MailboxError::Lock(path_str.clone(), e))?;

    // Pre-write fstat (spec §4.7.1): must be a regular file, must carry no
    // execute bit. Done after opening (so the lock is already held and no
    // other writer can race a swap-for-a-script under us) but before any
    // bytes are written.
    let meta = file
        .metadata()
        .map_err(|e| MailboxError::Stat(path_str.clone(), e))?;
    if !meta.is_file() {
        return Err(MailboxError::NotRegularFile(path_str));
    }
    if meta.permissions().mode() & 0o111 != 0 {
        return Err(MailboxError::ExecutableDestination(path_str));
    }

    file.write_all(content)
        .map_err(|e| MailboxError::Write(path_str.clone(), e))?;
    file.sync_data().map_err(|e| MailboxError::Write(path_str, e))?;

    drop(dotlock_guard);
    Ok(())
}

struct DotlockGuard(std::path::PathBuf);
impl Drop for DotlockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// `O_CREAT|O_EXCL` dot-locking alongside the kernel advisory lock (spec
/// §4.7.1: "kernel advisory lock (flock/fcntl) combined with dot-locking
/// when configured"). Spins briefly since dotlocks from other delivery
/// agents are expected to be short-lived.
fn acquire_dotlock(path: &Path) -> Result<DotlockGuard, MailboxError> {
    let lock_path = path.with_extension("lock");
    let path_str = path.display().to_string();
    for _ in 0..20 {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&lock_path)
        {
            Ok(_) => return Ok(DotlockGuard(lock_path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(MailboxError::Lock(path_str, e)),
        }
    }
    Err(MailboxError::Lock(
        path_str,
        io::Error::new(io::ErrorKind::WouldBlock, "dotlock held by another process"),
    ))
}
