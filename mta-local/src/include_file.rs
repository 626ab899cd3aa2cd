//! Forward/include file expansion (spec §4.7 step 3): such a file is
//! opened and read under the *file owner's* uid/gid whenever the alias
//! database itself is root-owned, so that an include file's owner can
//! never gain default-account (typically the mail system's own) privilege
//! by naming a different, higher-privileged file.
//!
//! Grounded in `original_source/src/local/token.c` + `include.c`'s
//! privilege-drop-around-the-read pattern, expressed here with
//! `nix::unistd`'s effective-id calls rather than a fork, since the read
//! is a bounded, synchronous, single-threaded operation.

use std::{
    fs,
    io::{self, Read},
    os::unix::fs::MetadataExt,
    path::Path,
};

use nix::unistd::{self, Gid, Uid};

#[derive(Debug, thiserror::Error)]
pub enum IncludeError {
    #[error("stat of include file ‘{0}’ failed")]
    Stat(String, #[source] io::Error),
    #[error("dropping privilege to uid {0} failed")]
    SetEuid(u32, #[source] nix::Error),
    #[error("dropping privilege to gid {0} failed")]
    SetEgid(u32, #[source] nix::Error),
    #[error("reading include file ‘{0}’ failed")]
    Read(String, #[source] io::Error),
    #[error("restoring privilege after reading ‘{0}’ failed")]
    Restore(String, #[source] nix::Error),
}

/// Reads `path`, dropping effective uid/gid to the file's owner first when
/// `alias_db_is_root_owned` is set. On a non-root-owned alias database the
/// read proceeds under the caller's current privilege (spec: the rewrite
/// is specifically to defend root-owned alias databases).
pub fn read_as_owner(path: &Path, alias_db_is_root_owned: bool) -> Result<Vec<u8>, IncludeError> {
    let path_str = path.display().to_string();
    let metadata = fs::metadata(path).map_err(|e| IncludeError::Stat(path_str.clone(), e))?;

    if !alias_db_is_root_owned {
        let mut buf = Vec::new();
        fs::File::open(path)
            .and_then(|mut f| f.read_to_end(&mut buf))
            .map_err(|e| IncludeError::Read(path_str.clone(), e))?;
        return Ok(buf);
    }

    let saved_euid = unistd::geteuid();
    let saved_egid = unistd::getegid();
    let owner_uid = Uid::from_raw(metadata.uid());
    let owner_gid = Gid::from_raw(metadata.gid());

    // Group first, then user: dropping uid first would forfeit the
    // privilege needed to change gid on most systems.
    unistd::setegid(owner_gid).map_err(|e| IncludeError::SetEgid(owner_gid.as_raw(), e))?;
    unistd::seteuid(owner_uid).map_err(|e| IncludeError::SetEuid(owner_uid.as_raw(), e))?;

    let read_result = fs::File::open(path).and_then(|mut f| {
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(buf)
    });

    unistd::seteuid(saved_euid).map_err(|e| IncludeError::Restore(path_str.clone(), e))?;
    unistd::setegid(saved_egid).map_err(|e| IncludeError::Restore(path_str.clone(), e))?;

    read_result.map_err(|e| IncludeError::Read(path_str, e))
}

/// Splits an include file's contents into one destination address per
/// non-blank, non-comment line, matching the flat list format
/// `:include:` files use.
pub fn parse_include_list(contents: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(contents)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_include_list_skips_blanks_and_comments() {
        let contents = b"alice@x\n# a comment\n\nbob@x\n  \ncarol@x\n";
        let parsed = parse_include_list(contents);
        assert_eq!(parsed, vec!["alice@x", "bob@x", "carol@x"]);
    }

    #[test]
    fn read_as_owner_without_root_owned_db_reads_directly() {
        let dir = tempdir::TempDir::new("mta-local-include").unwrap();
        let path = dir.path().join("list");
        fs::write(&path, "alice@x\nbob@x\n").unwrap();
        let contents = read_as_owner(&path, false).unwrap();
        assert_eq!(parse_include_list(&contents), vec!["alice@x", "bob@x"]);
    }
}
