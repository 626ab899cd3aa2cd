//! Queue file format and queue-directory lifecycle (spec §4.1).
//!
//! A queue file is an append-only sequence of typed records (see
//! [`codec`]), committed by setting the owner-execute bit -- any file
//! lacking it is, on startup, considered partially written and discarded.
//! Messages move between queue directories ([`mta_types::QueueDir`]) only
//! via `rename`, which this crate assumes is atomic on a single filesystem.

pub mod codec;
mod idalloc;

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use tracing::{debug, trace, warn};

pub use codec::{CodecError, PositionedRecord};
use mta_types::{QueueDir, QueueId, RecordType};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("I/O error on queue directory ‘{1}’")]
    Io(#[source] io::Error, PathBuf),
    #[error("queue file ‘{0}’ lacks the commit bit and is considered partially written")]
    NotCommitted(QueueId),
    #[error("queue file record error")]
    Codec(#[from] CodecError),
}

/// The owner-execute permission bit, used as the on-disk "fully written"
/// flag (spec §4.1, §6).
const COMMIT_MODE: u32 = 0o700;
const UNCOMMITTED_MODE: u32 = 0o600;

/// Root of an on-disk queue: owns the eight directories of spec §3/§6 and
/// the operations that move queue files between them.
pub struct QueueRoot {
    base: PathBuf,
    /// Whether `commit()` fsyncs file contents before flipping the commit
    /// bit. Spec §4.1: "optional, build-time". Exposed as a runtime flag
    /// here rather than a Cargo feature, since a single binary may want to
    /// run both a fsync-durable queue manager and a fast test harness.
    fsync_on_commit: bool,
}

impl QueueRoot {
    /// Opens (creating if needed) a queue root at `base`, with all eight
    /// queue/side-file directories present.
    pub fn new(base: impl Into<PathBuf>, fsync_on_commit: bool) -> io::Result<QueueRoot> {
        let base = base.into();
        for dir in ALL_DIRS {
            let path = base.join(dir.as_str());
            fs::create_dir_all(&path)?;
        }
        Ok(QueueRoot { base, fsync_on_commit })
    }

    pub fn dir_path(&self, dir: QueueDir) -> PathBuf {
        self.base.join(dir.as_str())
    }

    pub fn path_for(&self, dir: QueueDir, id: &QueueId) -> PathBuf {
        self.dir_path(dir).join(id.as_str())
    }

    /// `enter(queue) -> writable handle` (spec §4.1): allocates a fresh
    /// queue ID unique in `dir` and creates its file mode 0600, uncommitted.
    pub fn enter(&self, dir: QueueDir) -> Result<QueueWriter, QueueError> {
        let dir_path = self.dir_path(dir);
        let id = idalloc::allocate(&dir_path, |candidate| {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(UNCOMMITTED_MODE)
                .open(dir_path.join(candidate))
            {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e),
            }
        })
        .map_err(|e| QueueError::Io(e, dir_path.clone()))?;

        let path = dir_path.join(id.as_str());
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| QueueError::Io(e, path.clone()))?;
        trace!(id = %id, dir = %dir, "entered new queue file");
        Ok(QueueWriter {
            file,
            id,
            path,
            fsync_on_commit: self.fsync_on_commit,
        })
    }

    /// `open(queue, id, flags) -> handle` (spec §4.1): opens an existing,
    /// committed queue file for reading (and, if `writable`, for in-place
    /// tombstoning). Rejects files lacking the commit bit, per spec.
    pub fn open(&self, dir: QueueDir, id: &QueueId, writable: bool) -> Result<QueueReader, QueueError> {
        let path = self.path_for(dir, id);
        let meta = fs::metadata(&path).map_err(|e| QueueError::Io(e, path.clone()))?;
        if meta.permissions().mode() & 0o100 == 0 {
            return Err(QueueError::NotCommitted(id.clone()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| QueueError::Io(e, path.clone()))?;
        Ok(QueueReader {
            file,
            id: id.clone(),
        })
    }

    /// Whether `id` in `dir` has its commit bit set. Used by the startup
    /// scan (spec §4.5.6: "files without the commit bit are discarded").
    pub fn is_committed(&self, dir: QueueDir, id: &QueueId) -> io::Result<bool> {
        let meta = fs::metadata(self.path_for(dir, id))?;
        Ok(meta.permissions().mode() & 0o100 != 0)
    }

    /// `rename(from_queue, to_queue, id)` (spec §4.1): atomic on one
    /// filesystem; on failure the caller retains ownership (the source file
    /// is untouched, since `fs::rename` never partially completes).
    pub fn rename(&self, from: QueueDir, to: QueueDir, id: &QueueId) -> Result<(), QueueError> {
        let from_path = self.path_for(from, id);
        let to_path = self.path_for(to, id);
        fs::rename(&from_path, &to_path).map_err(|e| QueueError::Io(e, from_path))?;
        debug!(id = %id, from = %from, to = %to, "renamed queue file");
        Ok(())
    }

    /// `scan(queue) -> iterator<id>` (spec §4.1). Entries that aren't valid
    /// queue IDs (dotfiles, scratch files left by a crashed allocator) are
    /// silently skipped; the id-alphabet check is enough to tell them apart
    /// from real queue files, which are never renamed to a non-conforming
    /// name.
    pub fn scan(&self, dir: QueueDir) -> io::Result<Vec<QueueId>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.dir_path(dir))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = QueueId::parse(name.to_owned()) {
                    out.push(id);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Permanently removes a queue file: used both for fully-delivered
    /// messages (spec §4.5.5) and for discarding files that failed to
    /// commit (spec §4.5.6).
    pub fn discard(&self, dir: QueueDir, id: &QueueId) -> Result<(), QueueError> {
        let path = self.path_for(dir, id);
        match fs::remove_file(&path) {
            Ok(()) => {
                warn!(id = %id, dir = %dir, "discarded queue file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::Io(e, path)),
        }
    }

    /// Startup recovery pass over `dir` (spec §4.5.6: "on restart, rebuild
    /// in-core state from active directory; files without the commit bit
    /// are discarded"). Returns the committed IDs and discards the rest.
    pub fn recover(&self, dir: QueueDir) -> io::Result<Vec<QueueId>> {
        let mut committed = Vec::new();
        for id in self.scan(dir)? {
            match self.is_committed(dir, &id) {
                Ok(true) => committed.push(id),
                Ok(false) => {
                    warn!(id = %id, dir = %dir, "discarding uncommitted queue file found on startup");
                    let _ = self.discard(dir, &id);
                }
                Err(e) => warn!(id = %id, dir = %dir, error = %e, "failed to stat queue file during recovery"),
            }
        }
        Ok(committed)
    }
}

const ALL_DIRS: [QueueDir; 8] = [
    QueueDir::Maildrop,
    QueueDir::Incoming,
    QueueDir::Active,
    QueueDir::Deferred,
    QueueDir::Hold,
    QueueDir::Corrupt,
    QueueDir::Bounce,
    QueueDir::Defer,
];

/// A queue file open for appending, not yet committed.
pub struct QueueWriter {
    file: File,
    id: QueueId,
    path: PathBuf,
    fsync_on_commit: bool,
}

impl QueueWriter {
    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn write_record(&mut self, ty: RecordType, payload: &[u8]) -> Result<u64, QueueError> {
        Ok(codec::write_record(&mut self.file, ty, payload)?)
    }

    /// Finalizes the file: optional `fsync`, then sets the commit bit
    /// (owner-execute). Either failure demotes the result to a write error
    /// (spec §4.1), and the file is left uncommitted for a later recovery
    /// pass to discard.
    pub fn commit(self) -> Result<QueueId, QueueError> {
        use std::io::Write;
        let QueueWriter {
            mut file,
            id,
            path,
            fsync_on_commit,
        } = self;
        file.flush().map_err(|e| QueueError::Io(e, path.clone()))?;
        if fsync_on_commit {
            file.sync_all().map_err(|e| QueueError::Io(e, path.clone()))?;
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(COMMIT_MODE))
            .map_err(|e| QueueError::Io(e, path.clone()))?;
        drop(file);
        trace!(id = %id, "committed queue file");
        Ok(id)
    }

    /// Aborts the write: the file is left uncommitted (and thus harmless --
    /// a later recovery pass discards it), or eagerly unlinked if the
    /// caller already knows there's no point waiting for recovery.
    pub fn abandon(self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// A committed queue file opened for reading, and -- if opened writable --
/// for recipient tombstoning.
pub struct QueueReader {
    file: File,
    id: QueueId,
}

impl QueueReader {
    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn seek_to_start(&mut self) -> io::Result<()> {
        use std::io::{Seek, SeekFrom};
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        use std::io::{Seek, SeekFrom};
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn read_record(&mut self) -> Result<Option<PositionedRecord>, QueueError> {
        Ok(codec::read_record(&mut self.file)?)
    }

    pub fn records(&mut self) -> impl Iterator<Item = Result<PositionedRecord, CodecError>> + '_ {
        codec::iter_records(&mut self.file)
    }

    /// Tombstones the record at `offset` (spec §3 invariant 6): same
    /// length, different type tag. Idempotent by construction -- writing
    /// the same tag twice is indistinguishable from writing it once.
    pub fn tombstone(&mut self, offset: u64, new_ty: RecordType) -> Result<(), QueueError> {
        Ok(codec::tombstone_at(&mut self.file, offset, new_ty)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempdir::TempDir, QueueRoot) {
        let dir = tempdir::TempDir::new("mta-queue").unwrap();
        let root = QueueRoot::new(dir.path(), false).unwrap();
        (dir, root)
    }

    #[test]
    fn enter_write_commit_then_read_back() {
        let (_tmp, root) = root();
        let mut w = root.enter(QueueDir::Maildrop).unwrap();
        w.write_record(RecordType::From, b"a@x").unwrap();
        w.write_record(RecordType::Rcpt, b"b@y").unwrap();
        let id = w.commit().unwrap();

        let mut r = root.open(QueueDir::Maildrop, &id, false).unwrap();
        let records: Vec<_> = r.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ty, RecordType::From);
        assert_eq!(records[1].payload, b"b@y");
    }

    #[test]
    fn uncommitted_file_is_rejected_by_open() {
        let (_tmp, root) = root();
        let mut w = root.enter(QueueDir::Maildrop).unwrap();
        w.write_record(RecordType::From, b"a@x").unwrap();
        let id = w.id().clone();
        // Deliberately dropped without commit(): file stays mode 0600.
        drop(w);

        assert!(matches!(
            root.open(QueueDir::Maildrop, &id, false),
            Err(QueueError::NotCommitted(_))
        ));
        assert!(!root.is_committed(QueueDir::Maildrop, &id).unwrap());
    }

    #[test]
    fn recover_discards_uncommitted_files() {
        let (_tmp, root) = root();
        let w1 = root.enter(QueueDir::Active).unwrap();
        let id_uncommitted = w1.id().clone();
        drop(w1); // never committed

        let w2 = root.enter(QueueDir::Active).unwrap();
        let id_committed = w2.commit().unwrap();

        let recovered = root.recover(QueueDir::Active).unwrap();
        assert_eq!(recovered, vec![id_committed]);
        assert!(root.open(QueueDir::Active, &id_uncommitted, false).is_err());
        assert!(fs::metadata(root.path_for(QueueDir::Active, &id_uncommitted)).is_err());
    }

    #[test]
    fn rename_moves_between_directories() {
        let (_tmp, root) = root();
        let w = root.enter(QueueDir::Incoming).unwrap();
        let id = w.commit().unwrap();

        root.rename(QueueDir::Incoming, QueueDir::Active, &id).unwrap();
        assert!(root.open(QueueDir::Active, &id, false).is_ok());
        assert!(root.open(QueueDir::Incoming, &id, false).is_err());
    }

    #[test]
    fn tombstone_round_trips_through_reopen() {
        let (_tmp, root) = root();
        let mut w = root.enter(QueueDir::Active).unwrap();
        let rcpt_offset = w.write_record(RecordType::Rcpt, b"carol@example.com").unwrap();
        let id = w.commit().unwrap();

        let mut r = root.open(QueueDir::Active, &id, true).unwrap();
        r.tombstone(rcpt_offset, RecordType::Done).unwrap();
        drop(r);

        let mut r2 = root.open(QueueDir::Active, &id, false).unwrap();
        let records: Vec<_> = r2.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(records[0].ty, RecordType::Done);
    }

    #[test]
    fn scan_lists_only_valid_queue_ids() {
        let (_tmp, root) = root();
        let w = root.enter(QueueDir::Incoming).unwrap();
        let id = w.commit().unwrap();
        // A stray non-queue-id file (e.g. a leftover lockfile) must not
        // show up in scan().
        fs::write(root.dir_path(QueueDir::Incoming).join(".lock"), b"").unwrap();

        let ids = root.scan(QueueDir::Incoming).unwrap();
        assert_eq!(ids, vec![id]);
    }
}
