//! The one-to-one address mapping pipeline (spec §4.3.1) and one-to-many
//! address expansion (spec §4.3.2).

use tracing::warn;

use crate::lookup::{LookupError, LookupOutcome, LookupTable};

pub const ONE_TO_ONE_RECURSION_LIMIT: u32 = 10;
pub const ONE_TO_MANY_DEPTH_LIMIT: usize = 1000;
pub const ONE_TO_MANY_LIST_LIMIT: usize = 1000;

bitflags::bitflags! {
    /// Per-address outcome flags, folded into the message-wide
    /// [`crate::CleanupMask`] at commit time.
    pub struct MappingMask: u32 {
        /// A table lookup returned more than one value; the first was used.
        const MULTI_VALUED        = 0b0000_0001;
        /// A table-layer error aborted the pipeline for this address.
        const RECOVERABLE_ERROR   = 0b0000_0010;
        /// The one-to-one recursion limit (10) was hit before a fixed point.
        const ONE_TO_ONE_LIMIT    = 0b0000_0100;
        /// The one-to-many recursion depth cap (1000) was hit.
        const ONE_TO_MANY_DEPTH   = 0b0000_1000;
        /// The one-to-many expansion list length cap (1000) was hit.
        const ONE_TO_MANY_LENGTH  = 0b0001_0000;
    }
}

fn probe_first_match(
    tables: &[Box<dyn LookupTable>],
    key: &str,
) -> Result<Option<Vec<String>>, LookupError> {
    for table in tables {
        let folded;
        let probe_key = if table.case_fold() {
            folded = key.to_ascii_lowercase();
            folded.as_str()
        } else {
            key
        };
        match table.lookup(probe_key)? {
            LookupOutcome::Found(values) => return Ok(Some(values)),
            LookupOutcome::NotFound => continue,
        }
    }
    Ok(None)
}

/// Strips a trailing bare `@` and any surrounding quotes, giving the
/// canonical unquoted form spec's self-reference comparisons are defined
/// over (`cleanup_map1n.c`'s "canonical form" rules, per SPEC_FULL §4.3).
pub fn canonical_form(addr: &str) -> String {
    let addr = addr.strip_suffix('@').unwrap_or(addr);
    addr.trim_matches('"').to_owned()
}

fn addresses_match(a: &str, b: &str) -> bool {
    canonical_form(a).eq_ignore_ascii_case(&canonical_form(b))
}

/// One-to-one mapping (spec §4.3.1): repeatedly rewrite `addr` through
/// `tables` until the result reaches a fixed point (case-insensitive) or the
/// recursion limit is hit. Returns the final address and any flags raised
/// along the way.
pub fn map_one_to_one(addr: &str, tables: &[Box<dyn LookupTable>]) -> (String, MappingMask) {
    let mut mask = MappingMask::empty();
    let mut current = addr.to_owned();

    for _ in 0..ONE_TO_ONE_RECURSION_LIMIT {
        let found = match probe_first_match(tables, &current) {
            Ok(found) => found,
            Err(e) => {
                warn!(address = %current, error = %e, "lookup table error, aborting one-to-one mapping");
                mask.insert(MappingMask::RECOVERABLE_ERROR);
                return (current, mask);
            }
        };

        let Some(values) = found else {
            // No table matched: we're at a fixed point.
            return (current, mask);
        };

        if values.len() > 1 {
            warn!(address = %current, count = values.len(), "multi-valued one-to-one mapping result, using first value");
            mask.insert(MappingMask::MULTI_VALUED);
        }
        let next = values.into_iter().next().unwrap_or_default();

        if addresses_match(&next, &current) {
            return (next, mask);
        }
        current = next;
    }

    warn!(address = %addr, limit = ONE_TO_ONE_RECURSION_LIMIT, "one-to-one mapping recursion limit reached");
    mask.insert(MappingMask::ONE_TO_ONE_LIMIT);
    (current, mask)
}

/// Converts an internal (unquoted) address to external (quoted) form,
/// runs the mapping, then converts the result back. Spec §4.3.1: "one
/// converts between internal (unquoted) and external form around the
/// lookup".
pub fn map_one_to_one_internal(addr: &str, tables: &[Box<dyn LookupTable>]) -> (String, MappingMask) {
    let external = quote_external(addr);
    let (mapped, mask) = map_one_to_one(&external, tables);
    (unquote_internal(&mapped), mask)
}

fn quote_external(addr: &str) -> String {
    if addr.contains(|c: char| c.is_whitespace() || c == ',') && !addr.starts_with('"') {
        format!("\"{}\"", addr)
    } else {
        addr.to_owned()
    }
}

fn unquote_internal(addr: &str) -> String {
    addr.trim_matches('"').to_owned()
}

fn split_canonical(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

/// One-to-many address expansion (spec §4.3.2). Starts from `[input]` and
/// repeatedly expands entries in place, with the self-reference shortcut
/// (spec: "if any expansion result contains the left-hand-side exactly
/// ... expansion stops and the current list is returned") implemented so
/// the self-referencing entry is kept, un-expanded, as a terminal delivery
/// target while any other tokens from that same expansion are still
/// appended -- this matches the worked example in spec §8 scenario 3, where
/// `list@x -> alice@x, bob@x, list@x` yields `[list@x, alice@x, bob@x]`
/// rather than looping forever on `list@x`.
pub fn expand_one_to_many(input: &str, tables: &[Box<dyn LookupTable>]) -> (Vec<String>, MappingMask) {
    let mut mask = MappingMask::empty();
    let mut list = vec![input.to_owned()];
    let mut i = 0usize;
    let mut depth = 0usize;

    loop {
        if i >= list.len() {
            break;
        }
        if depth >= ONE_TO_MANY_DEPTH_LIMIT {
            warn!(input, limit = ONE_TO_MANY_DEPTH_LIMIT, "one-to-many expansion depth cap reached");
            mask.insert(MappingMask::ONE_TO_MANY_DEPTH);
            break;
        }

        let current = list[i].clone();
        let found = match probe_first_match(tables, &current) {
            Ok(found) => found,
            Err(e) => {
                warn!(address = %current, error = %e, "lookup table error, aborting one-to-many expansion for this slot");
                mask.insert(MappingMask::RECOVERABLE_ERROR);
                i += 1;
                continue;
            }
        };

        let Some(values) = found else {
            i += 1;
            continue;
        };
        if values.len() > 1 {
            mask.insert(MappingMask::MULTI_VALUED);
        }

        let tokens: Vec<String> = values.iter().flat_map(|v| split_canonical(v)).collect();
        let (self_refs, others): (Vec<_>, Vec<_>) =
            tokens.into_iter().partition(|t| addresses_match(t, &current));

        if !self_refs.is_empty() {
            // Preserve the self-reference in place (it becomes a terminal
            // delivery target, eg. the list's own user mailbox), append
            // everything else, then stop re-expanding this slot.
            for extra in others {
                if list.len() >= ONE_TO_MANY_LIST_LIMIT {
                    warn!(input, limit = ONE_TO_MANY_LIST_LIMIT, "one-to-many expansion list cap reached");
                    mask.insert(MappingMask::ONE_TO_MANY_LENGTH);
                    break;
                }
                list.push(extra);
            }
            i += 1;
            continue;
        }

        depth += 1;
        if others.is_empty() {
            // The table matched but produced nothing usable; treat as a
            // fixed point rather than looping on an empty replacement.
            i += 1;
            continue;
        }
        let mut others = others.into_iter();
        list[i] = others.next().unwrap();
        for extra in others {
            if list.len() >= ONE_TO_MANY_LIST_LIMIT {
                warn!(input, limit = ONE_TO_MANY_LIST_LIMIT, "one-to-many expansion list cap reached");
                mask.insert(MappingMask::ONE_TO_MANY_LENGTH);
                break;
            }
            list.push(extra);
        }
        // Deliberately don't advance `i`: re-visit this slot in case its
        // new content itself needs expanding.
    }

    (list, mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::FileTable;

    fn tables(pairs: &[(&str, &str)]) -> Vec<Box<dyn LookupTable>> {
        vec![Box::new(FileTable::from_pairs("t", pairs))]
    }

    #[test]
    fn one_to_one_chases_chain_to_fixed_point() {
        let t = tables(&[("a", "b"), ("b", "c")]);
        let (result, mask) = map_one_to_one("a", &t);
        assert_eq!(result, "c");
        assert!(mask.is_empty());
    }

    #[test]
    fn one_to_one_stops_at_self_mapping() {
        let t = tables(&[("a", "a")]);
        let (result, mask) = map_one_to_one("a", &t);
        assert_eq!(result, "a");
        assert!(mask.is_empty());
    }

    #[test]
    fn one_to_one_hits_recursion_limit_on_a_cycle() {
        let t = tables(&[("a", "b"), ("b", "a")]);
        let (result, mask) = map_one_to_one("a", &t);
        assert!(mask.contains(MappingMask::ONE_TO_ONE_LIMIT));
        // Ends on whichever side the 10th iteration lands on; either is a
        // faithful "preserve the most recent value" per spec's boundary
        // behaviour.
        assert!(result == "a" || result == "b");
    }

    #[test]
    fn one_to_one_multi_valued_uses_first() {
        let t: Vec<Box<dyn LookupTable>> =
            vec![Box::new(FileTable::parse("t", "a: x\na: y\n"))];
        let (result, mask) = map_one_to_one("a", &t);
        assert_eq!(result, "x");
        assert!(mask.contains(MappingMask::MULTI_VALUED));
    }

    #[test]
    fn one_to_one_recoverable_error_preserves_current_value() {
        let t: Vec<Box<dyn LookupTable>> =
            vec![Box::new(crate::lookup::UnavailableTable("t".to_owned()))];
        let (result, mask) = map_one_to_one("a", &t);
        assert_eq!(result, "a");
        assert!(mask.contains(MappingMask::RECOVERABLE_ERROR));
    }

    #[test]
    fn expansion_preserves_self_reference_scenario() {
        // spec §8 scenario 3
        let t = tables(&[("list@x", "alice@x, bob@x, list@x")]);
        let (result, mask) = expand_one_to_many("list@x", &t);
        assert_eq!(result, vec!["list@x", "alice@x", "bob@x"]);
        assert!(!mask.contains(MappingMask::ONE_TO_MANY_DEPTH));
    }

    #[test]
    fn expansion_chases_multiple_levels() {
        let t = tables(&[("a", "b, c"), ("b", "d")]);
        let (result, _mask) = expand_one_to_many("a", &t);
        assert_eq!(result, vec!["d", "c"]);
    }

    #[test]
    fn expansion_with_no_match_returns_singleton() {
        let t = tables(&[("other", "x")]);
        let (result, mask) = expand_one_to_many("a", &t);
        assert_eq!(result, vec!["a"]);
        assert!(mask.is_empty());
    }

    #[test]
    fn expansion_depth_cap_is_enforced() {
        // Each address maps to the next number, forming a long chain with
        // no fixed point and no self-reference, to exercise the depth cap.
        let mut pairs = Vec::new();
        let mut owned = Vec::new();
        for i in 0..2000 {
            owned.push((format!("n{}", i), format!("n{}", i + 1)));
        }
        for (k, v) in &owned {
            pairs.push((k.as_str(), v.as_str()));
        }
        let t = tables(&pairs);
        let (result, mask) = expand_one_to_many("n0", &t);
        assert!(mask.contains(MappingMask::ONE_TO_MANY_DEPTH));
        assert_eq!(result.len(), 1);
    }
}
