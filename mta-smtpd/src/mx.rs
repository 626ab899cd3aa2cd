//! MX resolution and self-loop detection (spec §4.6.1), lifted from
//! `original_source/src/smtp/smtp_addr.c`'s `smtp_addr_one` /
//! `smtp_compute_pref` and `global/own_inet_addr.c`'s `own_inet_addr_list`.

use std::{collections::BTreeMap, net::IpAddr};

use tracing::warn;
use trust_dns_resolver::{
    error::{ResolveError, ResolveErrorKind},
    proto::rr::Name,
};

#[derive(Debug, thiserror::Error)]
pub enum MxError {
    #[error("MX lookup for ‘{0}’ failed")]
    MxLookup(String, #[source] ResolveError),
    #[error("address lookup for ‘{0}’ failed")]
    AddressLookup(String, #[source] ResolveError),
    #[error("enumerating local interface addresses")]
    LocalAddrs(#[source] std::io::Error),
}

/// One candidate host, its resolved address, and the MX preference it was
/// found at (lower = more preferred).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Candidate {
    pub preference: u16,
    pub address: IpAddr,
}

/// The outcome of truncate-at-self (spec §4.6.1): the four cases the spec
/// enumerates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MxOutcome {
    /// Local host not found among candidates: the full list is used.
    NotLocal(Vec<Candidate>),
    /// Local host found, but candidates remain after removing its
    /// preference level.
    Truncated(Vec<Candidate>),
    /// Local host found at the single best preference: mail loops.
    SelfIsBestPreference,
    /// Local host found, but a strictly better preference existed in DNS
    /// and none of those resolved: retry later.
    PrimaryUnreachable,
}

/// Pure truncation logic, split out from DNS/interface I/O so it's testable
/// without a resolver or real network interfaces. `unresolved_preferences`
/// lists MX preferences that were present in DNS but whose names entirely
/// failed address resolution -- these never produce a `Candidate`, but
/// still count when deciding whether a strictly-better preference exists
/// (spec §4.6.1: "a better preference existed in DNS and none of those
/// resolved -> retry later").
pub fn truncate_at_self(
    mut candidates: Vec<Candidate>,
    local_addrs: &[IpAddr],
    unresolved_preferences: &[u16],
) -> MxOutcome {
    candidates.sort_by_key(|c| c.preference);

    let Some(self_preference) = candidates
        .iter()
        .find(|c| local_addrs.contains(&c.address))
        .map(|c| c.preference)
    else {
        return MxOutcome::NotLocal(candidates);
    };

    let best_preference = candidates
        .iter()
        .map(|c| c.preference)
        .chain(unresolved_preferences.iter().copied())
        .min()
        .unwrap();

    if self_preference == best_preference {
        return MxOutcome::SelfIsBestPreference;
    }

    if unresolved_preferences.iter().any(|&p| p < self_preference) {
        return MxOutcome::PrimaryUnreachable;
    }

    let remaining: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.preference != self_preference)
        .collect();
    MxOutcome::Truncated(remaining)
}

/// Full resolution: MX lookup (falling back to an implicit MX 0 A-record
/// lookup per spec §4.6.1's last paragraph if the domain has no MX),
/// preference-grouped address resolution, then self-truncation against the
/// local interface addresses.
pub async fn resolve<C, P>(
    resolver: &trust_dns_resolver::AsyncResolver<C, P>,
    domain: &str,
) -> Result<MxOutcome, MxError>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
{
    let mut by_preference: BTreeMap<u16, Vec<Name>> = BTreeMap::new();

    match resolver.mx_lookup(domain).await {
        Ok(lookup) => {
            for record in lookup.iter() {
                by_preference
                    .entry(record.preference())
                    .or_default()
                    .push(record.exchange().clone());
            }
        }
        Err(e) => {
            if !matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                return Err(MxError::MxLookup(domain.to_owned(), e));
            }
        }
    }
    if by_preference.is_empty() {
        // Implicit MX 0: resolve the domain name itself.
        by_preference.insert(0, vec![Name::from_ascii(domain).unwrap_or_default()]);
    }

    let mut candidates = Vec::new();
    let mut unresolved_preferences = Vec::new();
    let mut last_error = None;
    for (preference, names) in &by_preference {
        let mut any_resolved = false;
        for name in names {
            match resolver.lookup_ip(name.clone()).await {
                Ok(lookup) => {
                    for address in lookup.iter() {
                        candidates.push(Candidate {
                            preference: *preference,
                            address,
                        });
                        any_resolved = true;
                    }
                }
                Err(e) => {
                    warn!(mx = %name, preference = *preference, error = %e, "address lookup for MX candidate failed");
                    last_error = Some((name.to_string(), e));
                }
            }
        }
        if !any_resolved {
            unresolved_preferences.push(*preference);
        }
    }

    if candidates.is_empty() {
        // Nothing resolved at any preference: no local-host match is even
        // possible, so this is a plain lookup failure, not "primary
        // unreachable" (which requires a resolved, non-best candidate to
        // compare against).
        if let Some((name, e)) = last_error {
            return Err(MxError::AddressLookup(name, e));
        }
    }

    let local_addrs: Vec<IpAddr> = if_addrs::get_if_addrs()
        .map_err(MxError::LocalAddrs)?
        .into_iter()
        .map(|iface| iface.ip())
        .collect();

    Ok(truncate_at_self(candidates, &local_addrs, &unresolved_preferences))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(pref: u16, ip: &str) -> Candidate {
        Candidate {
            preference: pref,
            address: ip.parse().unwrap(),
        }
    }

    #[test]
    fn local_host_not_found_keeps_full_list() {
        let candidates = vec![cand(10, "1.2.3.4"), cand(20, "5.6.7.8")];
        let outcome = truncate_at_self(candidates.clone(), &["9.9.9.9".parse().unwrap()], &[]);
        assert_eq!(outcome, MxOutcome::NotLocal(candidates));
    }

    #[test]
    fn local_host_found_non_best_preference_truncates_that_level() {
        let candidates = vec![cand(10, "1.2.3.4"), cand(20, "5.6.7.8"), cand(20, "9.9.9.9")];
        let local = vec!["9.9.9.9".parse().unwrap()];
        let outcome = truncate_at_self(candidates, &local, &[]);
        assert_eq!(outcome, MxOutcome::Truncated(vec![cand(10, "1.2.3.4")]));
    }

    #[test]
    fn local_host_at_sole_best_preference_is_a_mail_loop() {
        let candidates = vec![cand(10, "1.2.3.4"), cand(20, "5.6.7.8")];
        let local = vec!["1.2.3.4".parse().unwrap()];
        let outcome = truncate_at_self(candidates, &local, &[]);
        assert_eq!(outcome, MxOutcome::SelfIsBestPreference);
    }

    #[test]
    fn local_host_found_but_truncation_empties_the_list_is_unreachable_primary() {
        let candidates = vec![cand(10, "1.2.3.4")];
        let local = vec!["1.2.3.4".parse().unwrap()];
        let outcome = truncate_at_self(candidates, &local, &[]);
        assert_eq!(outcome, MxOutcome::SelfIsBestPreference);
    }

    #[test]
    fn better_preference_unresolved_yields_unreachable_primary() {
        // Preference 5 existed in DNS but none of its MX names resolved;
        // only the self candidate at preference 20 came back.
        let candidates = vec![cand(20, "9.9.9.9")];
        let local = vec!["9.9.9.9".parse().unwrap()];
        let outcome = truncate_at_self(candidates, &local, &[5]);
        assert_eq!(outcome, MxOutcome::PrimaryUnreachable);
    }
}
