//! The SMTP Delivery Agent (spec §4.6): wraps `smtp-client`'s session state
//! machine with MX-preference grouping and self-loop truncation (§4.6.1),
//! and maps its errors onto the scheduler's per-recipient/per-connection
//! outcome vocabulary (`mta-qmgr`).

pub mod mx;

use std::sync::Arc;

use smtp_client::{Client, Config, TransportError, TransportErrorSeverity};
use smtp_message::Email;
use tracing::{info, warn};

pub use mx::{resolve as resolve_mx, truncate_at_self, Candidate, MxError, MxOutcome};

use mta_qmgr::{ConnectionOutcome, RecipientOutcome};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Mx(#[from] MxError),
    #[error("mail for domain ‘{0}’ would loop back to the local host")]
    MailLoop(String),
    #[error("unable to find a reachable primary relay for ‘{0}’")]
    PrimaryUnreachable(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Classifies a finished delivery attempt into the outcome vocabulary the
/// Queue Manager's `qmgr_entry_done` expects (spec §4.5.6, §4.6): a
/// connection-level failure marks the whole Queue dead for this round,
/// while a mail/mailbox-level rejection is scoped to the one recipient.
pub fn classify(error: &TransportError) -> (RecipientOutcome, ConnectionOutcome) {
    use TransportErrorSeverity::*;
    match error.severity() {
        Local | NetworkTransient | MailSystemTransient | MailSystemPermanent => {
            (RecipientOutcome::SoftFailure, ConnectionOutcome::SiteFailure)
        }
        MailTransient | MailboxTransient => (RecipientOutcome::SoftFailure, ConnectionOutcome::Ok),
        MailPermanent | MailboxPermanent => (RecipientOutcome::HardFailure, ConnectionOutcome::Ok),
    }
}

/// One delivery request (spec §4.6): one session attempt against one
/// next-hop, for one or more recipients sharing the destination domain.
pub struct DeliveryAgent<C, P, Cfg>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
    Cfg: Config,
{
    client: Client<C, P, Cfg>,
    resolver: trust_dns_resolver::AsyncResolver<C, P>,
    /// If set, a domain found to be `SelfIsBestPreference` is not a hard
    /// mail loop: it's handed off to local delivery under this transport
    /// name instead (spec §4.6.1: "fail permanent unless a configured
    /// best-MX transport overrides to local delivery").
    best_mx_transport: Option<String>,
}

impl<C, P, Cfg> DeliveryAgent<C, P, Cfg>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
    Cfg: Config,
{
    pub fn new(
        resolver: trust_dns_resolver::AsyncResolver<C, P>,
        cfg: Arc<Cfg>,
        best_mx_transport: Option<String>,
    ) -> DeliveryAgent<C, P, Cfg> {
        DeliveryAgent {
            client: Client::new(resolver.clone(), cfg),
            resolver,
            best_mx_transport,
        }
    }

    /// Resolves `domain`'s MX set, truncated at self, and reports which of
    /// the four §4.6.1 cases applies.
    pub async fn resolve_domain(&self, domain: &str) -> Result<Vec<Candidate>, DeliveryError> {
        match mx::resolve(&self.resolver, domain).await? {
            MxOutcome::NotLocal(c) | MxOutcome::Truncated(c) => Ok(c),
            MxOutcome::SelfIsBestPreference => {
                if let Some(transport) = &self.best_mx_transport {
                    info!(domain, transport, "self is best MX, handing off to local delivery transport");
                    Ok(Vec::new())
                } else {
                    Err(DeliveryError::MailLoop(domain.to_owned()))
                }
            }
            MxOutcome::PrimaryUnreachable => Err(DeliveryError::PrimaryUnreachable(domain.to_owned())),
        }
    }

    /// One session attempt (spec §4.6's state machine, implemented inside
    /// `smtp_client::Sender::send`): connects to `ip`, then `MAIL`/`RCPT`/
    /// `DATA` for a single recipient.
    pub async fn deliver_one<Reader>(
        &self,
        ip: std::net::IpAddr,
        from: Option<&Email>,
        to: &Email,
        mail: Reader,
    ) -> Result<(), DeliveryError>
    where
        Reader: futures::AsyncRead,
    {
        let mut sender = self.client.connect_to_ip(ip, 25).await?;
        sender.send(from, to, mail).await?;
        Ok(())
    }

    /// Tries every candidate address in preference order, stopping at the
    /// first success; per spec §4.6 "on connect/banner/EHLO failure the
    /// state machine falls back to the next candidate".
    pub async fn deliver<Reader, MkReader>(
        &self,
        domain: &str,
        candidates: &[Candidate],
        from: Option<&Email>,
        to: &Email,
        mut mail: MkReader,
    ) -> Result<(), DeliveryError>
    where
        Reader: futures::AsyncRead,
        MkReader: FnMut() -> Reader,
    {
        let mut last_error = None;
        for candidate in candidates {
            match self.deliver_one(candidate.address, from, to, mail()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(address = %candidate.address, error = %e, "delivery attempt failed, trying next candidate");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DeliveryError::PrimaryUnreachable(domain.to_owned())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_permanent_mailbox_to_hard_recipient_failure() {
        let err = TransportError::PermanentMailbox(smtp_message::Reply {
            code: smtp_message::ReplyCode::MAILBOX_UNAVAILABLE,
            ecode: None,
            text: vec!["no such user".into()],
        });
        let (rcpt, conn) = classify(&err);
        assert_eq!(rcpt, RecipientOutcome::HardFailure);
        assert_eq!(conn, ConnectionOutcome::Ok);
    }

    #[test]
    fn classify_maps_connecting_to_site_failure() {
        let err = TransportError::Connecting(
            "127.0.0.1".parse().unwrap(),
            25,
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        );
        let (rcpt, conn) = classify(&err);
        assert_eq!(rcpt, RecipientOutcome::SoftFailure);
        assert_eq!(conn, ConnectionOutcome::SiteFailure);
    }
}
