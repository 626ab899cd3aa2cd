//! `sendmail -bs` (spec §6): runs one SMTP session directly on stdio,
//! handing each accepted mail transaction to Cleanup the same way the
//! standalone `smtp-server`/`mta-smtpd` listener would (spec §4.3's
//! submission path does not distinguish the two).

use std::{borrow::Cow, io, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::io::{AllowStdIo, AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{info, warn};

use mta_cleanup::{CleanupContext, Submission};
use mta_queue::QueueRoot;
use mta_trigger::Endpoint;
use smtp_message::{Email, EscapedDataReader, Reply, ReplyCode};
use smtp_server::{interact, ConnectionMetadata, Decision, IsAlreadyTls, MailMetadata};

/// [`smtp_server::Config`] that accepts any well-formed envelope and hands
/// the finished `DATA` transaction straight to Cleanup (spec §4.3).
/// Address-level policy (filtering, relay rules) is the out-of-scope
/// lookup-table backend's concern (spec §1); this stdio entry point only
/// needs to get the bytes into the queue.
pub struct StdioConfig<'q> {
    queue: &'q QueueRoot,
    trigger: Option<&'q Endpoint>,
    hostname: String,
}

impl<'q> StdioConfig<'q> {
    pub fn new(queue: &'q QueueRoot, trigger: Option<&'q Endpoint>, hostname: String) -> Self {
        StdioConfig {
            queue,
            trigger,
            hostname,
        }
    }
}

#[async_trait]
impl<'q> smtp_server::Config for StdioConfig<'q> {
    type ConnectionUserMeta = ();
    type MailUserMeta = ();

    fn hostname(&self) -> Cow<'static, str> {
        Cow::Owned(self.hostname.clone())
    }

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<()>) {}

    /// stdio has no transport to upgrade; STARTTLS is never advertised
    /// (`can_do_tls` defaults to `false` once this returns an error), so
    /// this is unreachable in practice.
    async fn tls_accept<IO>(
        &self,
        _io: IO,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> io::Result<duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TLS is not available on a stdio SMTP session",
        ))
    }

    fn can_do_tls(&self, _conn_meta: &ConnectionMetadata<()>) -> bool {
        false
    }

    async fn filter_from(
        &self,
        _from: &mut Option<Email<&str>>,
        _meta: &mut MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision {
        Decision::Accept
    }

    async fn filter_to(
        &self,
        _to: &mut Email<&str>,
        _meta: &mut MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision {
        Decision::Accept
    }

    async fn handle_mail<'a, R>(
        &self,
        reader: &mut EscapedDataReader<'a, R>,
        meta: MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision
    where
        R: Send + Unpin + AsyncRead,
    {
        let mut content = Vec::new();
        if reader.read_to_end(&mut content).await.is_err() {
            return Decision::Reject(Reply {
                code: ReplyCode::MAILBOX_TEMPORARILY_UNAVAILABLE,
                ecode: None,
                text: vec!["i/o error reading message content".into()],
            });
        }
        reader.complete();

        let submission = Submission {
            sender: meta.from.as_ref().map(email_to_string),
            sender_full_name: None,
            recipients: meta.to.iter().map(email_to_string).collect(),
            content,
        };
        let mut ctx = CleanupContext::new(&[], &[]);
        match mta_cleanup::process(&mut ctx, &submission, self.queue, self.trigger) {
            Ok(id) => {
                info!(id = %id, "message accepted into the queue over stdio SMTP");
                Decision::Accept
            }
            Err(mta_cleanup::CleanupError::Rejected(reason)) => Decision::Reject(Reply {
                code: ReplyCode::POLICY_REASON,
                ecode: None,
                text: vec![owned_reply_text(reason)],
            }),
            Err(e) => {
                warn!(error = %e, "submission over stdio SMTP failed");
                Decision::Reject(Reply {
                    code: ReplyCode::MAILBOX_TEMPORARILY_UNAVAILABLE,
                    ecode: None,
                    text: vec!["queue write failed".into()],
                })
            }
        }
    }
}

/// Builds a reply-line text segment from an owned `String`, mirroring
/// `MaybeUtf8`'s own `From<&str>` conversion logic (ascii vs. utf8
/// variant) since that blanket impl only covers borrows that already
/// outlive `'static`, not an owned reason string built at request time.
fn owned_reply_text(s: String) -> smtp_message::MaybeUtf8<Cow<'static, str>> {
    if s.is_ascii() {
        smtp_message::MaybeUtf8::Ascii(Cow::Owned(s))
    } else {
        smtp_message::MaybeUtf8::Utf8(Cow::Owned(s))
    }
}

/// Renders an [`Email`] back to its wire form (`local@host`, or bare
/// `local` for a null hostname), since `smtp-message` intentionally keeps
/// no `Display` impl on the wire types (callers are meant to go through
/// `as_io_slices` to avoid an extra allocation on the hot path; this one
/// submission-time conversion is not hot).
fn email_to_string<S: AsRef<str>>(email: &Email<S>) -> String {
    let mut buf = Vec::new();
    for slice in email.as_io_slices() {
        buf.extend_from_slice(&slice);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Runs the `-bs` session to completion against `queue`, best-effort
/// waking the Queue Manager (via `trigger`) after each accepted message.
pub fn run(queue: &QueueRoot, trigger: Option<&Endpoint>, hostname: String) -> io::Result<()> {
    let reader = AllowStdIo::new(io::stdin());
    let writer = AllowStdIo::new(io::stdout());
    let io = duplexify::Duplex::new(reader, writer);
    let cfg = Arc::new(StdioConfig::new(queue, trigger, hostname));
    smol::block_on(interact(io, IsAlreadyTls::No, (), cfg))
}
