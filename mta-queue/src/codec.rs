//! Record-level codec for one queue file (spec §4.1, §6): `enter`/`open`
//! produce a handle; `read_record`/`write_record` work the typed
//! `<type:1><len:varint><payload>` stream.

use std::io::{self, Read, Seek, SeekFrom, Write};

use mta_types::{read_varint, write_varint, RecordType};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error reading/writing a queue record")]
    Io(#[from] io::Error),
    #[error("unknown record type tag {0}")]
    UnknownRecordType(u8),
    #[error("malformed record length varint")]
    BadLength(#[from] mta_types::VarintError),
    #[error("record payload length {0} exceeds the per-record cap {1}")]
    PayloadTooLarge(u64, u64),
}

/// A record read back from a queue file, together with the file offset its
/// type-tag byte started at -- this is what `mta-qmgr` remembers in order to
/// tombstone a `Rcpt` record later without re-scanning the whole envelope
/// section.
#[derive(Clone, Debug)]
pub struct PositionedRecord {
    pub offset: u64,
    pub ty: RecordType,
    pub payload: Vec<u8>,
}

/// Cap on a single record's payload length: defends `read_record` against a
/// corrupt length prefix turning into a multi-gigabyte allocation.
pub const MAX_RECORD_LEN: u64 = 64 * 1024 * 1024;

/// Appends one record to `w`, returning the offset its type tag was written
/// at.
pub fn write_record<W: Write + Seek>(
    w: &mut W,
    ty: RecordType,
    payload: &[u8],
) -> Result<u64, CodecError> {
    let offset = w.stream_position()?;
    let mut header = vec![ty as u8];
    write_varint(payload.len() as u64, &mut header);
    w.write_all(&header)?;
    w.write_all(payload)?;
    Ok(offset)
}

/// Reads one record starting at the handle's current position. Returns
/// `Ok(None)` at a clean end-of-file (no bytes at all before the type tag);
/// any other truncation is an I/O-level `UnexpectedEof`, which surfaces as
/// `BadMessage` to the caller per spec §7.
pub fn read_record<R: Read + Seek>(r: &mut R) -> Result<Option<PositionedRecord>, CodecError> {
    let offset = r.stream_position()?;
    let mut tag = [0u8; 1];
    match r.read(&mut tag)? {
        0 => return Ok(None),
        _ => {}
    }
    let ty = RecordType::from_u8(tag[0]).ok_or(CodecError::UnknownRecordType(tag[0]))?;

    // The varint is at most 10 bytes for a u64; read byte-by-byte since we
    // don't know its length in advance.
    let mut len_buf = Vec::with_capacity(4);
    loop {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)?;
        let continues = b[0] & 0x80 != 0;
        len_buf.push(b[0]);
        if !continues {
            break;
        }
        if len_buf.len() > 10 {
            return Err(CodecError::BadLength(mta_types::VarintError::Overflow));
        }
    }
    let (len, _) = read_varint(&len_buf)?;
    if len > MAX_RECORD_LEN {
        return Err(CodecError::PayloadTooLarge(len, MAX_RECORD_LEN));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;

    Ok(Some(PositionedRecord {
        offset,
        ty,
        payload,
    }))
}

/// Iterates every record in a queue file from its current position to EOF.
pub fn iter_records<'r, R: Read + Seek>(
    r: &'r mut R,
) -> impl Iterator<Item = Result<PositionedRecord, CodecError>> + 'r {
    std::iter::from_fn(move || match read_record(r) {
        Ok(Some(rec)) => Some(Ok(rec)),
        Ok(None) => None,
        Err(e) => Some(Err(e)),
    })
}

/// Tombstones the record whose type tag lives at `offset`: overwrites just
/// that one byte. Same length, different value, as spec §3 invariant 6
/// requires -- this is the sole permitted mutation of a sealed record.
pub fn tombstone_at<W: Write + Seek>(
    w: &mut W,
    offset: u64,
    new_ty: RecordType,
) -> Result<(), CodecError> {
    w.seek(SeekFrom::Start(offset))?;
    w.write_all(&[new_ty as u8])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = Cursor::new(Vec::new());
        write_record(&mut buf, RecordType::From, b"alice@example.com").unwrap();
        write_record(&mut buf, RecordType::Rcpt, b"bob@example.com").unwrap();
        write_record(&mut buf, RecordType::End, b"").unwrap();

        buf.set_position(0);
        let records: Vec<_> = iter_records(&mut buf).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].ty, RecordType::From);
        assert_eq!(records[0].payload, b"alice@example.com");
        assert_eq!(records[1].ty, RecordType::Rcpt);
        assert_eq!(records[2].ty, RecordType::End);
    }

    #[test]
    fn tombstone_preserves_offsets_of_later_records() {
        let mut buf = Cursor::new(Vec::new());
        let rcpt_offset =
            write_record(&mut buf, RecordType::Rcpt, b"carol@example.com").unwrap();
        write_record(&mut buf, RecordType::End, b"").unwrap();

        tombstone_at(&mut buf, rcpt_offset, RecordType::Done).unwrap();

        buf.set_position(0);
        let records: Vec<_> = iter_records(&mut buf).collect::<Result<_, _>>().unwrap();
        assert_eq!(records[0].ty, RecordType::Done);
        assert_eq!(records[0].payload, b"carol@example.com");
        assert_eq!(records[1].ty, RecordType::End);
    }

    #[test]
    fn double_tombstone_is_idempotent() {
        let mut buf = Cursor::new(Vec::new());
        let offset = write_record(&mut buf, RecordType::Rcpt, b"dan@example.com").unwrap();
        tombstone_at(&mut buf, offset, RecordType::Done).unwrap();
        tombstone_at(&mut buf, offset, RecordType::Done).unwrap();

        buf.set_position(0);
        let records: Vec<_> = iter_records(&mut buf).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ty, RecordType::Done);
    }

    #[test]
    fn truncated_length_varint_errors() {
        let mut buf = Cursor::new(vec![RecordType::Rcpt as u8, 0x80, 0x80]);
        assert!(read_record(&mut buf).is_err());
    }

    #[test]
    fn unknown_tag_errors() {
        let mut buf = Cursor::new(vec![0xFFu8, 0x00]);
        assert!(matches!(
            read_record(&mut buf),
            Err(CodecError::UnknownRecordType(0xFF))
        ));
    }

    #[test]
    fn empty_input_is_clean_eof() {
        let mut buf = Cursor::new(Vec::<u8>::new());
        assert!(read_record(&mut buf).unwrap().is_none());
    }
}
