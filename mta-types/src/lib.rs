//! Shared types for the mta workspace: queue directories, queue IDs, the
//! varint-prefixed queue record format (spec §6), and the small set of
//! record type tags shared between `mta-queue` (which writes them) and
//! every other crate that needs to read a queue file back (`mta-qmgr`,
//! `mta-cleanup`, `mta-bounce`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the on-disk queue directories a message can live in (spec §3).
///
/// Variants are ordered the way messages actually flow through them, which
/// is also the order `Display` prints their directory name in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum QueueDir {
    Maildrop,
    Incoming,
    Active,
    Deferred,
    Hold,
    Corrupt,
    Bounce,
    Defer,
}

impl QueueDir {
    /// Relative path component for this directory, per spec §6.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueDir::Maildrop => "maildrop",
            QueueDir::Incoming => "incoming",
            QueueDir::Active => "active",
            QueueDir::Deferred => "deferred",
            QueueDir::Hold => "hold",
            QueueDir::Corrupt => "corrupt",
            QueueDir::Bounce => "bounce",
            QueueDir::Defer => "defer",
        }
    }

    /// The status-code class a recipient left behind in this directory maps
    /// to, when read back by `mta-bounce` (spec §4.8): bounce is permanent
    /// (5.x.x), defer is transient (4.x.x). Any other directory has no
    /// associated DSN class.
    pub fn dsn_class(&self) -> Option<u8> {
        match self {
            QueueDir::Bounce => Some(5),
            QueueDir::Defer => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for QueueDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alphabet queue IDs are restricted to, per spec §6: `[0-9A-F]`.
pub const QUEUE_ID_ALPHABET: &[u8; 16] = b"0123456789ABCDEF";

/// An opaque queue ID, unique across all queue directories at any instant
/// (spec §3, invariant 1). Always composed of `QUEUE_ID_ALPHABET` characters.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(String);

impl QueueId {
    /// Builds a `QueueId` from raw text, validating the alphabet. Used when
    /// parsing a queue ID back out of a filename or a wire protocol.
    pub fn parse(s: impl Into<String>) -> Result<QueueId, InvalidQueueId> {
        let s = s.into();
        if s.is_empty() || !s.bytes().all(|b| QUEUE_ID_ALPHABET.contains(&b)) {
            return Err(InvalidQueueId(s));
        }
        Ok(QueueId(s))
    }

    /// Builds a `QueueId` from components already known to be valid, eg. the
    /// inode-derived allocator in `mta-queue`. Not validated: callers own the
    /// alphabet invariant.
    pub fn from_valid(s: String) -> QueueId {
        debug_assert!(s.bytes().all(|b| QUEUE_ID_ALPHABET.contains(&b)));
        QueueId(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("‘{0}’ is not a valid queue id (must be non-empty and hex-uppercase)")]
pub struct InvalidQueueId(String);

/// One queue-file record type tag (spec §6). The numeric values are an
/// implementation detail of this workspace, but per spec must be stable
/// across restarts: do not renumber.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    Size = 1,
    Time = 2,
    Full = 3,
    From = 4,
    Rcpt = 5,
    /// Tombstone of a `Rcpt` record: same length, different tag (spec §3).
    Done = 6,
    Orcp = 7,
    Warn = 8,
    Attr = 9,
    Verp = 10,
    Mesg = 11,
    Norm = 12,
    Cont = 13,
    Xtra = 14,
    Rrto = 15,
    Erto = 16,
    Prio = 17,
    End = 18,
}

impl RecordType {
    pub fn from_u8(b: u8) -> Option<RecordType> {
        use RecordType::*;
        Some(match b {
            1 => Size,
            2 => Time,
            3 => Full,
            4 => From,
            5 => Rcpt,
            6 => Done,
            7 => Orcp,
            8 => Warn,
            9 => Attr,
            10 => Verp,
            11 => Mesg,
            12 => Norm,
            13 => Cont,
            14 => Xtra,
            15 => Rrto,
            16 => Erto,
            17 => Prio,
            18 => End,
            _ => return None,
        })
    }

    /// Which of the three contiguous sections this record type belongs to
    /// (spec §3): envelope, message content, or extracted-info. `Mesg` and
    /// `Xtra` are the boundary markers between sections, `End` terminates
    /// the file.
    pub fn section(&self) -> Section {
        use RecordType::*;
        match self {
            Size | Time | Full | From | Rcpt | Done | Orcp | Warn | Attr | Verp => {
                Section::Envelope
            }
            Mesg | Norm | Cont => Section::Content,
            Xtra | Rrto | Erto | Prio => Section::Extracted,
            End => Section::Terminator,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Section {
    Envelope,
    Content,
    Extracted,
    Terminator,
}

/// Writes `v` as a little-endian base-128 varint (spec §6: "seven bits per
/// byte, high bit = continuation"), appending to `out`.
pub fn write_varint(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reads a little-endian base-128 varint from the front of `buf`, returning
/// the value and the number of bytes consumed.
pub fn read_varint(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(VarintError::Overflow);
        }
        v |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((v, i + 1));
        }
        shift += 7;
    }
    Err(VarintError::Truncated)
}

#[derive(Debug, thiserror::Error)]
pub enum VarintError {
    #[error("varint continues past the end of the buffer")]
    Truncated,
    #[error("varint does not fit in 64 bits")]
    Overflow,
}

/// A decoded-but-not-yet-interpreted queue record: `<type:1><len:varint><payload>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawRecord {
    pub ty: RecordType,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 5 + self.payload.len());
        out.push(self.ty as u8);
        write_varint(self.payload.len() as u64, &mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Tombstones this record in place: same length, different type tag.
    /// Used for `Rcpt` → `Done` (spec §3, invariant 6).
    pub fn retag(&mut self, ty: RecordType) {
        self.ty = ty;
    }
}

/// The named attribute an `Attr` record carries (`name=value`, spec §6).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn encode(&self) -> Vec<u8> {
        format!("{}={}", self.name, self.value).into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Option<Attribute> {
        let s = std::str::from_utf8(payload).ok()?;
        let (name, value) = s.split_once('=')?;
        Some(Attribute {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }
}

/// VERP delimiter pair (spec §3, §6): the two characters Cleanup and the
/// delivery agents use to splice a recipient address into the envelope
/// sender for per-recipient bounce addressing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VerpDelimiters {
    pub first: u8,
    pub second: u8,
}

impl Default for VerpDelimiters {
    fn default() -> Self {
        VerpDelimiters {
            first: b'+',
            second: b'=',
        }
    }
}

/// Sysexits taxonomy (spec §6, §4.7.2), used to classify pipe-delivery exit
/// statuses and process-level fatal errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitClass {
    Ok,
    /// Temporary failure: caller should defer and retry.
    TempFail,
    /// Permanent failure: caller should bounce.
    PermFail,
}

/// Maps a sysexits-style exit code to a delivery outcome, per spec §4.7.2's
/// "exit status mapped: 0 → sent; values from the sysexits taxonomy → bounce
/// (permanent) or defer (temporary) per table".
pub fn classify_exit_status(code: i32) -> ExitClass {
    match code {
        0 => ExitClass::Ok,
        // EX_TEMPFAIL, EX_OSERR, EX_OSFILE, EX_CANTCREAT, EX_IOERR, EX_UNAVAILABLE:
        // environment-transient, retry later.
        69 | 71 | 72 | 73 | 74 | 75 => ExitClass::TempFail,
        // Everything else in the sysexits range (EX_USAGE, EX_DATAERR,
        // EX_NOINPUT, EX_NOUSER, EX_NOHOST, EX_SOFTWARE, EX_NOPERM,
        // EX_CONFIG, ...) as well as any non-sysexits non-zero code is
        // treated as a permanent misconfiguration of the destination.
        _ => ExitClass::PermFail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn queue_id_rejects_bad_alphabet() {
        assert!(QueueId::parse("0A1f").is_err()); // lowercase not allowed
        assert!(QueueId::parse("").is_err());
        assert!(QueueId::parse("00FF12").is_ok());
    }

    #[test]
    fn record_type_round_trips_tags() {
        for tag in 1u8..=18 {
            let ty = RecordType::from_u8(tag).expect("tag should decode");
            assert_eq!(ty as u8, tag);
        }
        assert!(RecordType::from_u8(0).is_none());
        assert!(RecordType::from_u8(19).is_none());
    }

    #[test]
    fn raw_record_encode_has_stable_shape() {
        let rec = RawRecord {
            ty: RecordType::Rcpt,
            payload: b"alice@example.com".to_vec(),
        };
        let encoded = rec.encode();
        assert_eq!(encoded[0], RecordType::Rcpt as u8);
        let (len, consumed) = read_varint(&encoded[1..]).unwrap();
        assert_eq!(len as usize, rec.payload.len());
        assert_eq!(&encoded[1 + consumed..], &rec.payload[..]);
    }

    #[test]
    fn tombstone_preserves_length() {
        let mut rec = RawRecord {
            ty: RecordType::Rcpt,
            payload: b"bob@example.com".to_vec(),
        };
        let before_len = rec.encode().len();
        rec.retag(RecordType::Done);
        assert_eq!(rec.encode().len(), before_len);
        assert_eq!(rec.ty, RecordType::Done);
    }

    #[quickcheck]
    fn varint_round_trips(v: u64) -> bool {
        let mut buf = Vec::new();
        write_varint(v, &mut buf);
        let (decoded, consumed) = read_varint(&buf).unwrap();
        decoded == v && consumed == buf.len()
    }

    #[test]
    fn varint_truncated_errors() {
        let buf = [0x80u8, 0x80];
        assert!(matches!(read_varint(&buf), Err(VarintError::Truncated)));
    }

    #[test]
    fn attribute_round_trips() {
        let attr = Attribute {
            name: "priority".to_owned(),
            value: "5".to_owned(),
        };
        let decoded = Attribute::decode(&attr.encode()).unwrap();
        assert_eq!(decoded.name, attr.name);
        assert_eq!(decoded.value, attr.value);
    }

    #[test]
    fn exit_status_classification() {
        assert!(matches!(classify_exit_status(0), ExitClass::Ok));
        assert!(matches!(classify_exit_status(75), ExitClass::TempFail)); // EX_TEMPFAIL
        assert!(matches!(classify_exit_status(64), ExitClass::PermFail)); // EX_USAGE
    }
}
