//! Trigger Bus (spec §4.2): a tiny best-effort wakeup protocol used to nudge
//! a sleeping service (usually the Queue Manager) instead of waiting for its
//! coarse periodic timer. Two transport variants are supported, matching
//! spec's "named pipe" and "connection-oriented local socket"; both are
//! one-shot, best-effort sends -- a dropped wakeup is tolerated because
//! pollers also wake on a periodic timer.

use std::{
    io::{self, Write},
    os::unix::{fs::FileTypeExt, net::UnixStream},
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::trace;

/// Single-octet commands (spec §4.2). Multi-byte payloads, when used, are
/// plain concatenations of these with no framing -- there is no length
/// prefix on the trigger bus, unlike the queue record format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Trigger {
    /// Wake up and re-scan everything this service is responsible for.
    Wakeup = b'W',
    /// Flush the deferred queue now, ignoring backoff deadlines.
    FlushDeferred = b'D',
    /// Flush deferred mail for one site only; the site name follows as
    /// additional octets with no length prefix, per spec.
    FlushSite = b'S',
    /// Re-scan every queue directory from scratch (eg. after `sendmail -q`).
    ScanAll = b'A',
}

impl Trigger {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Trigger> {
        match b {
            b'W' => Some(Trigger::Wakeup),
            b'D' => Some(Trigger::FlushDeferred),
            b'S' => Some(Trigger::FlushSite),
            b'A' => Some(Trigger::ScanAll),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("I/O error on trigger endpoint ‘{1}’")]
    Io(#[source] io::Error, PathBuf),
}

/// One endpoint a wakeup can be sent to. Which transport it is depends on
/// what already exists at `path`: a fifo (named pipe) or a unix socket.
/// Supervisor-managed services each own one such endpoint (spec §4.4).
pub enum Endpoint {
    Fifo(PathBuf),
    Socket(PathBuf),
}

impl Endpoint {
    /// Creates a named-pipe endpoint at `path`, the way Cleanup's
    /// queue-manager wakeup channel is set up (spec §4.2: "a named pipe
    /// (one byte written, open is non-blocking, writer never waits for
    /// reader)").
    pub fn create_fifo(path: impl Into<PathBuf>) -> Result<Endpoint, TriggerError> {
        let path = path.into();
        match nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(TriggerError::Io(io::Error::from(e), path)),
        }
        Ok(Endpoint::Fifo(path))
    }

    /// Registers a (presumably already-listening) unix socket endpoint,
    /// used for the connection-oriented variant.
    pub fn socket(path: impl Into<PathBuf>) -> Endpoint {
        Endpoint::Socket(path.into())
    }

    pub fn path(&self) -> &Path {
        match self {
            Endpoint::Fifo(p) | Endpoint::Socket(p) => p,
        }
    }

    /// Best-effort send of one trigger byte. Never blocks waiting for a
    /// reader: a fifo open is non-blocking and a socket connect has a short
    /// timeout, and any failure (ENXIO, ECONNREFUSED, timeout) is swallowed
    /// -- per spec, "dropped wakeups are tolerated".
    pub fn send(&self, trigger: Trigger) {
        self.send_bytes(&[trigger.as_byte()])
    }

    /// Sends a multi-byte payload with no framing, eg. `FlushSite` followed
    /// by the site name's bytes.
    pub fn send_bytes(&self, bytes: &[u8]) {
        let result = match self {
            Endpoint::Fifo(path) => send_fifo(path, bytes),
            Endpoint::Socket(path) => send_socket(path, bytes),
        };
        match result {
            Ok(()) => trace!(path = %self.path().display(), "sent trigger"),
            Err(e) => trace!(path = %self.path().display(), error = %e, "dropped trigger"),
        }
    }
}

fn send_fifo(path: &Path, bytes: &[u8]) -> io::Result<()> {
    // O_NONBLOCK means this returns ENXIO immediately if nobody has the
    // read end open, rather than blocking for a reader that may never
    // come -- exactly spec's "writer never waits for reader".
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;
    let fd = nix::fcntl::open(path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty())
        .map_err(io::Error::from)?;
    let mut file = unsafe { <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
    file.write_all(bytes)
}

fn send_socket(path: &Path, bytes: &[u8]) -> io::Result<()> {
    // "connect, write small fixed buffer, close without reading": no
    // response is awaited, matching a fire-and-forget wakeup.
    let mut stream = UnixStream::connect(path)?;
    stream.set_write_timeout(Some(Duration::from_millis(200)))?;
    stream.write_all(bytes)?;
    Ok(())
}

/// Returns whether `path` is currently a fifo, to let a service auto-detect
/// which transport its configured endpoint uses.
pub fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_byte_round_trips() {
        for t in [
            Trigger::Wakeup,
            Trigger::FlushDeferred,
            Trigger::FlushSite,
            Trigger::ScanAll,
        ] {
            assert_eq!(Trigger::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(Trigger::from_byte(b'?'), None);
    }

    #[test]
    fn send_to_fifo_with_no_reader_does_not_block_or_panic() {
        let dir = tempdir::TempDir::new("mta-trigger").unwrap();
        let fifo_path = dir.path().join("qmgr.trigger");
        let endpoint = Endpoint::create_fifo(&fifo_path).unwrap();
        assert!(is_fifo(&fifo_path));
        // Nobody is reading: this must return promptly rather than hang.
        endpoint.send(Trigger::Wakeup);
    }

    #[test]
    fn send_to_missing_socket_is_swallowed() {
        let dir = tempdir::TempDir::new("mta-trigger").unwrap();
        let endpoint = Endpoint::socket(dir.path().join("does-not-exist.sock"));
        // Must not panic even though nothing is listening.
        endpoint.send(Trigger::FlushDeferred);
    }

    #[test]
    fn socket_round_trip_delivers_bytes() {
        let dir = tempdir::TempDir::new("mta-trigger").unwrap();
        let sock_path = dir.path().join("qmgr.sock");
        let listener = std::os::unix::net::UnixListener::bind(&sock_path).unwrap();
        listener.set_nonblocking(true).unwrap();

        let endpoint = Endpoint::socket(&sock_path);
        endpoint.send(Trigger::ScanAll);

        // Give the listener a moment; best-effort poll since there is no
        // async runtime in this unit test.
        let mut got = None;
        for _ in 0..50 {
            if let Ok((mut stream, _)) = listener.accept() {
                use std::io::Read;
                let mut buf = [0u8; 1];
                stream.set_nonblocking(false).unwrap();
                stream.read_exact(&mut buf).unwrap();
                got = Some(buf[0]);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(got, Some(Trigger::ScanAll.as_byte()));
    }
}
