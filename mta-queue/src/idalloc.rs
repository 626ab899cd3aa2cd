//! Queue-ID allocation (spec §4.1): "an ID derived from the inode number and
//! the current timestamp, retried until unique in the target directory."

use std::{
    io,
    os::unix::fs::MetadataExt,
    path::Path,
};

use chrono::Utc;
use mta_types::QueueId;

/// Allocates a queue ID unique within `dir`, by creating `name_hint` (a
/// private scratch file) to learn its inode number, then folding that
/// together with the current time into a hex string. The scratch file's
/// final name *is* the allocated ID: callers rename it into place rather
/// than creating a second file, so there is never a window with two files
/// for one ID.
///
/// `create_candidate` is called with each candidate ID's filename; it should
/// attempt an exclusive create (`O_CREAT | O_EXCL`) and return `Ok(true)` on
/// success, `Ok(false)` on `EEXIST`, or `Err` on any other I/O error. This
/// mirrors the allocator being agnostic of whether the candidate is the
/// queue file itself or a placeholder.
pub fn allocate<F>(dir: &Path, mut create_candidate: F) -> io::Result<QueueId>
where
    F: FnMut(&str) -> io::Result<bool>,
{
    // Seed the inode-derived half of the ID from a throwaway file in `dir`
    // itself: its inode is guaranteed unique on this filesystem at this
    // instant, which is exactly the uniqueness property spec.md wants.
    let seed_path = dir.join(format!(".idseed.{}", std::process::id()));
    let seed_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&seed_path)?;
    let ino = seed_file.metadata()?.ino();
    drop(seed_file);
    let _ = std::fs::remove_file(&seed_path);

    let mut attempt: u32 = 0;
    loop {
        let now = Utc::now();
        let candidate = format!(
            "{:08X}{:08X}{:04X}",
            now.timestamp() as u32,
            ino as u32,
            attempt
        );
        if create_candidate(&candidate)? {
            return Ok(QueueId::from_valid(candidate));
        }
        attempt = attempt.wrapping_add(1);
        if attempt > 0xFFFF {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "exhausted queue id namespace for this inode/timestamp pair",
            ));
        }
    }
}
