//! Command-line surface (spec §6): a sendmail-compatible multi-call binary.
//! `structopt` derives the long-form flags; [`crate::normalize_argv`]
//! rewrites the historical single-dash multi-letter flags (`-bp`, `-bs`,
//! `-qRsite`, ...) into them before parsing, since `structopt` only
//! supports single-character short options.

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "sendmail",
    about = "Store-and-forward SMTP MTA: sendmail-compatible submission and queue-control CLI"
)]
pub struct Opt {
    /// Envelope sender (historical `-f`).
    #[structopt(long, short = "f")]
    pub from: Option<String>,

    /// Submitter full name, used for the queue file's FULL record
    /// (historical `-F`).
    #[structopt(long, short = "F")]
    pub full_name: Option<String>,

    /// Read recipients from the `To`/`Cc`/`Bcc` message headers instead of
    /// the command line (historical `-t`).
    #[structopt(long, short = "t")]
    pub read_recipients_from_headers: bool,

    /// Ignored for sendmail-CLI compatibility: historical `-i` ("don't
    /// treat a lone dot as end-of-input") has no effect here since stdin
    /// is read to EOF regardless.
    #[structopt(short = "i")]
    pub ignore_dots: bool,

    /// Print the queue listing (historical `-bp`/`mailq`).
    #[structopt(long)]
    pub mailq: bool,

    /// Rebuild/validate the alias database (historical `-bi`/`newaliases`).
    #[structopt(long)]
    pub newaliases: bool,

    /// Run one SMTP session on stdio (historical `-bs`).
    #[structopt(long)]
    pub stdin_smtp: bool,

    /// Request a full queue flush (historical bare `-q`).
    #[structopt(long)]
    pub queue_flush: bool,

    /// Request a flush of deferred mail for one site only (historical
    /// `-qRsite`).
    #[structopt(long)]
    pub flush_site: Option<String>,

    /// Queue root directory; defaults to `$MAIL_CONFIG` or
    /// `/var/spool/mta` (spec §1's non-goal of a general configuration
    /// language leaves this the one path a deployment must supply).
    #[structopt(long, parse(from_os_str))]
    pub queue_dir: Option<PathBuf>,

    /// Path to the one-to-one address mapping table, consulted by
    /// `newaliases` and by submission (spec §4.3.1).
    #[structopt(long, parse(from_os_str))]
    pub aliases: Option<PathBuf>,

    /// Remaining positional arguments: recipient addresses.
    pub recipients: Vec<String>,
}
