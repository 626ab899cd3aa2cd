//! Cleanup (spec §4.3): turns a raw submission into a canonical queue file
//! in `incoming`, running every envelope and header address through the
//! one-to-one mapping pipeline (§4.3.1) and one-to-many expansion (§4.3.2).

pub mod lookup;
pub mod mapping;

use chrono::Utc;
use tracing::warn;

use lookup::LookupTable;
use mta_queue::QueueRoot;
use mta_trigger::{Endpoint, Trigger};
use mta_types::{QueueDir, QueueId, RecordType};

bitflags::bitflags! {
    /// Accumulates recoverable problems across a whole submission (spec
    /// §9: "explicit request context threaded through Cleanup", replacing
    /// a global error mask). Decided only at commit time (spec §7).
    pub struct CleanupMask: u32 {
        const RECOVERABLE_LOOKUP_ERROR = 0b0000_0001;
        const RECURSION_LIMIT_HIT      = 0b0000_0010;
        const EXPANSION_CAP_HIT        = 0b0000_0100;
        /// A hard parse error was recorded; the message cannot be admitted.
        const BAD_MESSAGE               = 0b0000_1000;
    }
}

impl From<mapping::MappingMask> for CleanupMask {
    fn from(m: mapping::MappingMask) -> CleanupMask {
        let mut out = CleanupMask::empty();
        if m.contains(mapping::MappingMask::RECOVERABLE_ERROR) {
            out.insert(CleanupMask::RECOVERABLE_LOOKUP_ERROR);
        }
        if m.contains(mapping::MappingMask::ONE_TO_ONE_LIMIT) {
            out.insert(CleanupMask::RECURSION_LIMIT_HIT);
        }
        if m.contains(mapping::MappingMask::ONE_TO_MANY_DEPTH)
            || m.contains(mapping::MappingMask::ONE_TO_MANY_LENGTH)
        {
            out.insert(CleanupMask::EXPANSION_CAP_HIT);
        }
        out
    }
}

/// The request context threaded through one submission (spec §9), carrying
/// the lookup-table chains and accumulating the error mask in place of a
/// process-wide global.
pub struct CleanupContext<'t> {
    pub one_to_one_tables: &'t [Box<dyn LookupTable>],
    pub one_to_many_tables: &'t [Box<dyn LookupTable>],
    pub mask: CleanupMask,
}

impl<'t> CleanupContext<'t> {
    pub fn new(
        one_to_one_tables: &'t [Box<dyn LookupTable>],
        one_to_many_tables: &'t [Box<dyn LookupTable>],
    ) -> CleanupContext<'t> {
        CleanupContext {
            one_to_one_tables,
            one_to_many_tables,
            mask: CleanupMask::empty(),
        }
    }

    fn map_address(&mut self, addr: &str) -> String {
        let (mapped, mask) = mapping::map_one_to_one_internal(addr, self.one_to_one_tables);
        self.mask.insert(mask.into());
        mapped
    }

    fn expand_address(&mut self, addr: &str) -> Vec<String> {
        let (list, mask) = mapping::expand_one_to_many(addr, self.one_to_many_tables);
        self.mask.insert(mask.into());
        list
    }
}

/// A raw submission as received from a submitter (eg. `smtp-server`'s
/// envelope, or the `sendmail` CLI's stdin message). Content is held in
/// full rather than streamed, since the out-of-scope MIME tokenizer (spec
/// §1) is what would otherwise drive incremental header parsing.
pub struct Submission {
    pub sender: Option<String>,
    pub sender_full_name: Option<String>,
    pub recipients: Vec<String>,
    /// Raw RFC 5322 message content (headers + body), CRLF- or LF-terminated
    /// lines.
    pub content: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error(transparent)]
    Queue(#[from] mta_queue::QueueError),
    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// The header names whose value is address-bearing and thus rewritten
/// through the one-to-one mapping pipeline (spec §4.3 step 3).
const ADDRESS_HEADERS: &[&str] = &["From", "To", "Cc", "Reply-To", "Sender"];

/// Runs one submission through Cleanup end to end (spec §4.3, steps 1-4):
/// allocates a queue file, writes the mapped/expanded envelope, rewrites
/// address-bearing headers, and on success renames into `incoming` and
/// sends a wakeup to the Queue Manager. On a hard error the file is
/// discarded (or, if any content was already readable, moved to
/// `corrupt`).
pub fn process(
    ctx: &mut CleanupContext,
    submission: &Submission,
    queue: &QueueRoot,
    qmgr_wakeup: Option<&Endpoint>,
) -> Result<QueueId, CleanupError> {
    let mut writer = queue.enter(QueueDir::Maildrop)?;

    writer.write_record(RecordType::Time, &Utc::now().timestamp().to_le_bytes())?;
    writer.write_record(RecordType::Size, &(submission.content.len() as u64).to_le_bytes())?;

    let mapped_sender = submission
        .sender
        .as_deref()
        .map(|s| ctx.map_address(s))
        .unwrap_or_default();
    writer.write_record(RecordType::From, mapped_sender.as_bytes())?;

    if let Some(full_name) = &submission.sender_full_name {
        writer.write_record(RecordType::Full, full_name.as_bytes())?;
    }

    let mut canonical_recipients = Vec::new();
    for rcpt in &submission.recipients {
        let mapped = ctx.map_address(rcpt);
        let expanded = ctx.expand_address(&mapped);
        canonical_recipients.extend(expanded);
    }
    if canonical_recipients.is_empty() {
        writer.abandon();
        return Err(CleanupError::Rejected("no recipients after mapping".to_owned()));
    }
    for rcpt in &canonical_recipients {
        writer.write_record(RecordType::Rcpt, rcpt.as_bytes())?;
    }

    writer.write_record(RecordType::Mesg, &[])?;
    for line in rewrite_address_headers(ctx, &submission.content) {
        writer.write_record(RecordType::Norm, &line)?;
    }

    writer.write_record(RecordType::Xtra, &[])?;
    writer.write_record(RecordType::End, &[])?;

    if ctx.mask.contains(CleanupMask::BAD_MESSAGE) {
        writer.abandon();
        return Err(CleanupError::Rejected("message failed validation".to_owned()));
    }

    let id = writer.commit()?;
    queue.rename(QueueDir::Maildrop, QueueDir::Incoming, &id)?;
    if let Some(ep) = qmgr_wakeup {
        ep.send(Trigger::Wakeup);
    }
    Ok(id)
}

/// Splits `content` into lines and rewrites the value of any
/// [`ADDRESS_HEADERS`] line through the one-to-one mapping pipeline,
/// leaving everything else untouched. Folded (continuation) header lines
/// are left as-is: only the header's first line carries an address in the
/// headers this crate rewrites.
fn rewrite_address_headers(ctx: &mut CleanupContext, content: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for raw_line in content.split(|&b| b == b'\n') {
        let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
        if let Some(rewritten) = try_rewrite_header(ctx, line) {
            out.push(rewritten);
        } else {
            out.push(line.to_vec());
        }
    }
    out
}

fn try_rewrite_header(ctx: &mut CleanupContext, line: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(line).ok()?;
    let (name, value) = text.split_once(':')?;
    let header_name = ADDRESS_HEADERS
        .iter()
        .find(|h| h.eq_ignore_ascii_case(name.trim()))?;
    let value = value.trim();
    // Best-effort: treat the whole header value as one address. A fuller
    // implementation would tokenize display-name/<addr> pairs, but that
    // tokenization is the address-parser boundary collaborator (spec §1),
    // out of scope here.
    let mapped = ctx.map_address(value);
    if mapped != value {
        warn!(header = %header_name, from = value, to = %mapped, "rewrote address-bearing header");
    }
    Some(format!("{}: {}", header_name, mapped).into_bytes())
}
