//! Bounce/defer side-file logging and delivery-status notification
//! composition (spec §4.8).
//!
//! Per message, up to two flat side files live alongside the queue proper:
//! `bounce/<id>` and `defer/<id>`. Each holds one line per failed recipient,
//! `<recipient>: <reason>\n`; a record is tombstoned in place by
//! overwriting its leading byte with a sentinel, and a reader simply skips
//! any line that starts with it. This mirrors
//! `original_source/global/bounce_log.c`'s `bounce_log_read`/
//! `bounce_log_delrcpt` pair, down to the `<recipient>: text` wire shape,
//! except the angle brackets the original wraps the recipient in are
//! dropped here since this format has no other use of `:` to disambiguate
//! against.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use mta_types::QueueDir;

/// Tombstone sentinel a deleted record's first byte is overwritten with.
/// Chosen to never collide with a live record's first byte, since live
/// records always start with a recipient address character.
pub const TOMBSTONE: u8 = b'!';

#[derive(Debug, thiserror::Error)]
pub enum BounceError {
    #[error("opening side file ‘{0}’ failed")]
    Open(String, #[source] io::Error),
    #[error("reading side file ‘{0}’ failed")]
    Read(String, #[source] io::Error),
    #[error("writing side file ‘{0}’ failed")]
    Write(String, #[source] io::Error),
    #[error("side file ‘{0}’ is only usable for in-memory records (forged)")]
    Forged(String),
    #[error("‘{0}’ is not a valid envelope sender address")]
    InvalidSender(String),
}

/// One recipient's failure record, whether read from a side file or
/// forged in memory (spec §4.8: "A 'forge' operation constructs an
/// in-memory record without touching any file, for non-DSN notifications").
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub recipient: String,
    pub status: String,
    pub text: String,
    /// Byte offset of this record's start in its side file, used by
    /// [`SideFile::delete_record`]. `None` for forged records.
    offset: Option<u64>,
}

impl Record {
    /// Constructs a record with no backing file (spec §4.8's "forge").
    /// The result can be read back but [`SideFile::delete_record`] has
    /// nothing to do with it, since it was never written anywhere.
    pub fn forge(recipient: impl Into<String>, status: impl Into<String>, text: impl Into<String>) -> Record {
        Record {
            recipient: recipient.into(),
            status: status.into(),
            text: text.into(),
            offset: None,
        }
    }
}

/// Which side file kind, and the DSN status-code class it implies (spec
/// §4.8: "A status code (4.x.x for defer, 5.x.x for bounce...attached at
/// read time").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    Bounce,
    Defer,
}

impl Kind {
    fn queue_dir(self) -> QueueDir {
        match self {
            Kind::Bounce => QueueDir::Bounce,
            Kind::Defer => QueueDir::Defer,
        }
    }

    fn default_status(self) -> &'static str {
        match self {
            Kind::Bounce => "5.0.0",
            Kind::Defer => "4.0.0",
        }
    }

    /// Derives a `Kind` from a queue directory, for callers that already
    /// hold a [`QueueDir`] (spec §4.8: "derived from the queue directory
    /// name").
    pub fn from_queue_dir(dir: QueueDir) -> Option<Kind> {
        match dir {
            QueueDir::Bounce => Some(Kind::Bounce),
            QueueDir::Defer => Some(Kind::Defer),
            _ => None,
        }
    }
}

/// An open bounce or defer side file for one message id.
pub struct SideFile {
    path: PathBuf,
    kind: Kind,
    file: File,
}

impl SideFile {
    /// Opens (creating if absent) the side file of the given `kind` for
    /// message `id` under `root` (the queue root directory, whose
    /// `bounce/`/`defer/` subdirectories hold these files alongside the
    /// committed-queue directories `mta-queue` manages).
    pub fn open(root: &Path, kind: Kind, id: &str) -> Result<SideFile, BounceError> {
        let dir = root.join(kind.queue_dir().as_str());
        fs::create_dir_all(&dir).map_err(|e| BounceError::Open(dir.display().to_string(), e))?;
        let path = dir.join(id);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| BounceError::Open(path.display().to_string(), e))?;
        Ok(SideFile { path, kind, file })
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one failed-recipient record (spec §4.8: "Append one record
    /// per failed recipient").
    pub fn append(&mut self, recipient: &str, reason: &str) -> Result<(), BounceError> {
        let sanitized_recipient = sanitize(recipient);
        let sanitized_reason = sanitize(reason);
        let line = format!("{}: {}\n", sanitized_recipient, sanitized_reason);
        self.file
            .write_all(line.as_bytes())
            .map_err(|e| BounceError::Write(self.path.display().to_string(), e))
    }

    /// Reads every live (non-tombstoned) record, attaching this side
    /// file's default status code class to each.
    pub fn read_all(&mut self) -> Result<Vec<Record>, BounceError> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| BounceError::Read(self.path.display().to_string(), e))?;
        let mut contents = String::new();
        self.file
            .read_to_string(&mut contents)
            .map_err(|e| BounceError::Read(self.path.display().to_string(), e))?;

        let mut records = Vec::new();
        let mut offset: u64 = 0;
        for line in contents.split_inclusive('\n') {
            let line_len = line.len() as u64;
            if line.as_bytes().first() == Some(&TOMBSTONE) || line.trim().is_empty() {
                offset += line_len;
                continue;
            }
            match line.splitn(2, ": ").collect::<Vec<_>>().as_slice() {
                [recipient, text] => records.push(Record {
                    recipient: recipient.to_string(),
                    status: self.kind.default_status().to_owned(),
                    text: text.trim_end_matches('\n').to_owned(),
                    offset: Some(offset),
                }),
                _ => tracing::warn!(path = %self.path.display(), line, "malformed bounce/defer record, skipping"),
            }
            offset += line_len;
        }
        Ok(records)
    }

    /// Tombstones `record` in place by overwriting its leading byte (spec
    /// §4.8: "Records may be tombstoned by overwriting the leading byte
    /// with a sentinel").
    pub fn delete_record(&mut self, record: &Record) -> Result<(), BounceError> {
        let offset = record
            .offset
            .ok_or_else(|| BounceError::Forged(record.recipient.clone()))?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| BounceError::Write(self.path.display().to_string(), e))?;
        self.file
            .write_all(&[TOMBSTONE])
            .map_err(|e| BounceError::Write(self.path.display().to_string(), e))?;
        self.file
            .seek(SeekFrom::End(0))
            .map_err(|e| BounceError::Write(self.path.display().to_string(), e))?;
        Ok(())
    }

    /// Removes the side file entirely, once its notification has been
    /// flushed successfully (spec §4.8: "on success unlink the side
    /// file").
    pub fn unlink(self) -> Result<(), BounceError> {
        fs::remove_file(&self.path).map_err(|e| BounceError::Write(self.path.display().to_string(), e))
    }
}

/// Control characters are stripped the way `bounce_log.c`'s `printable()`
/// sanitizes a record before writing it, so a malicious or buggy reason
/// string can't forge a second record by embedding a newline.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_control() { '?' } else { c })
        .collect()
}

/// Builds the minimal RFC 3462-shaped multipart body for a delivery
/// status notification: a human-readable preamble part followed by one
/// `Final-Recipient`/`Status`/`Diagnostic-Code` block per failed
/// recipient. This is not a general MIME writer (out of scope per spec
/// §1's "MIME tokenizer" boundary) -- just enough structure to attach the
/// original envelope's failure detail to a notification message.
pub fn compose_report(records: &[Record], boundary: &str) -> String {
    let mut body = String::new();
    body.push_str("This is a MIME-encapsulated message.\n\n");
    body.push_str(&format!("--{}\n", boundary));
    body.push_str("Content-Description: Notification\n");
    body.push_str("Content-Type: text/plain; charset=us-ascii\n\n");
    body.push_str("The following message could not be delivered to one or more recipients:\n\n");
    for record in records {
        body.push_str(&format!("  {}: {} ({})\n", record.recipient, record.text, record.status));
    }
    body.push('\n');
    body.push_str(&format!("--{}\n", boundary));
    body.push_str("Content-Description: Delivery report\n");
    body.push_str("Content-Type: message/delivery-status\n\n");
    for record in records {
        body.push_str(&format!("Final-Recipient: rfc822; {}\n", record.recipient));
        body.push_str(&format!("Status: {}\n", record.status));
        body.push_str(&format!("Diagnostic-Code: X-Local; {}\n\n", record.text));
    }
    body.push_str(&format!("--{}--\n", boundary));
    body
}

/// The reserved envelope sender identity notification messages are
/// submitted under (spec §4.8: "enqueue via Cleanup under a dedicated
/// sender identity"). The empty reverse-path, per RFC 5321 §6.1's rule
/// that DSNs must never themselves bounce.
pub const NOTIFICATION_SENDER: &str = "";

/// Builds a [`mta_cleanup::Submission`] for the notification covering
/// `records`, addressed back to `original_sender`, ready to hand to
/// `mta_cleanup::process`. Validates `original_sender` parses as an
/// address before composing, since a malformed envelope sender must not
/// silently swallow a bounce.
pub fn build_notification(
    original_sender: &str,
    message_id: &str,
    records: &[Record],
) -> Result<mta_cleanup::Submission, BounceError> {
    if !original_sender.is_empty()
        && (!original_sender.contains('@') || original_sender.chars().any(char::is_control))
    {
        return Err(BounceError::InvalidSender(original_sender.to_owned()));
    }
    let boundary = format!("===={}====", message_id);
    let report_body = compose_report(records, &boundary);

    let mut content = String::new();
    content.push_str("From: Mail Delivery System <MAILER-DAEMON>\n");
    content.push_str(&format!("To: {}\n", original_sender));
    content.push_str("Subject: Mail delivery failed\n");
    content.push_str("MIME-Version: 1.0\n");
    content.push_str(&format!(
        "Content-Type: multipart/report; report-type=delivery-status; boundary=\"{}\"\n\n",
        boundary
    ));
    content.push_str(&report_body);

    Ok(mta_cleanup::Submission {
        sender: Some(NOTIFICATION_SENDER.to_owned()),
        sender_full_name: Some("Mail Delivery System".to_owned()),
        recipients: vec![original_sender.to_owned()],
        content: content.into_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_all_round_trips() {
        let dir = tempdir::TempDir::new("mta-bounce").unwrap();
        let mut side_file = SideFile::open(dir.path(), Kind::Defer, "ABCDEF").unwrap();
        side_file.append("alice@example.com", "connection timed out").unwrap();
        side_file.append("bob@example.com", "451 greylisted").unwrap();

        let records = side_file.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].recipient, "alice@example.com");
        assert_eq!(records[0].status, "4.0.0");
        assert_eq!(records[1].text, "451 greylisted");
    }

    #[test]
    fn tombstoned_record_is_skipped_on_reread() {
        let dir = tempdir::TempDir::new("mta-bounce").unwrap();
        let mut side_file = SideFile::open(dir.path(), Kind::Bounce, "ABCDEF").unwrap();
        side_file.append("alice@example.com", "mailbox full").unwrap();
        side_file.append("bob@example.com", "unknown user").unwrap();

        let records = side_file.read_all().unwrap();
        side_file.delete_record(&records[0]).unwrap();

        let remaining = side_file.read_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].recipient, "bob@example.com");
    }

    #[test]
    fn bounce_status_class_is_five_defer_is_four() {
        let dir = tempdir::TempDir::new("mta-bounce").unwrap();
        let mut bounce = SideFile::open(dir.path(), Kind::Bounce, "X").unwrap();
        bounce.append("a@x", "no such user").unwrap();
        assert_eq!(bounce.read_all().unwrap()[0].status, "5.0.0");

        let mut defer = SideFile::open(dir.path(), Kind::Defer, "Y").unwrap();
        defer.append("a@x", "temp failure").unwrap();
        assert_eq!(defer.read_all().unwrap()[0].status, "4.0.0");
    }

    #[test]
    fn reason_containing_control_characters_is_sanitized() {
        let dir = tempdir::TempDir::new("mta-bounce").unwrap();
        let mut side_file = SideFile::open(dir.path(), Kind::Defer, "X").unwrap();
        side_file.append("a@x", "line one\nForged: record\n").unwrap();
        let records = side_file.read_all().unwrap();
        // A literal newline in the reason must not be able to start a
        // second, forged record.
        assert_eq!(records.len(), 1);
        assert!(!records[0].text.contains('\n'));
    }

    #[test]
    fn forged_record_has_no_offset_to_delete() {
        let record = Record::forge("postmaster@x", "5.1.1", "user unknown");
        let dir = tempdir::TempDir::new("mta-bounce").unwrap();
        let mut side_file = SideFile::open(dir.path(), Kind::Bounce, "X").unwrap();
        assert!(matches!(
            side_file.delete_record(&record),
            Err(BounceError::Forged(_))
        ));
    }

    #[test]
    fn compose_report_lists_every_recipient() {
        let records = vec![
            Record::forge("alice@x", "5.1.1", "unknown user"),
            Record::forge("bob@x", "4.4.1", "connection timed out"),
        ];
        let report = compose_report(&records, "BOUNDARY");
        assert!(report.contains("Final-Recipient: rfc822; alice@x"));
        assert!(report.contains("Status: 4.4.1"));
        assert!(report.contains("--BOUNDARY--"));
    }

    #[test]
    fn build_notification_rejects_malformed_original_sender() {
        let records = vec![Record::forge("a@x", "5.1.1", "bounced")];
        let err = build_notification("not an email address", "ABCDEF", &records).unwrap_err();
        assert!(matches!(err, BounceError::InvalidSender(_)));
    }

    #[test]
    fn build_notification_uses_empty_reverse_path() {
        let records = vec![Record::forge("a@x", "5.1.1", "bounced")];
        let submission = build_notification("a@x", "ABCDEF", &records).unwrap();
        assert_eq!(submission.sender, Some(String::new()));
        assert_eq!(submission.recipients, vec!["a@x".to_owned()]);
    }
}
