//! Alias expansion (spec §4.7 step 2): recursive lookup against an
//! in-memory alias table, bounded to a depth cap and guarding against
//! self-reference the way `original_source/src/local/alias.c` does — a
//! left-hand side that reappears in its own expansion falls through to
//! ordinary user delivery rather than looping or erroring.

use std::collections::HashMap;

/// One alias's right-hand side: a list of destinations, each either a
/// plain address/local name, an include/forward-file reference, or a
/// pipe command — left un-interpreted here and handled by the caller once
/// expansion settles.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    Address(String),
    Include(String),
    Command(String),
}

/// The alias depth cap (spec §4.7 step 2: "depth cap ~100").
pub const MAX_DEPTH: u32 = 100;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum AliasError {
    #[error("alias expansion exceeded the depth cap of {0}")]
    DepthExceeded(u32),
}

pub struct AliasTable {
    entries: HashMap<String, Vec<Destination>>,
    /// Owner alias, e.g. `owner-foo` for alias `foo`: if present, its
    /// single address destination becomes the envelope sender and bounce
    /// redirect target for this branch (spec §4.7 step 2).
    owners: HashMap<String, String>,
}

/// One fully-expanded alias branch: the terminal destinations plus,
/// if an `owner-<alias>` override applied anywhere along the path, the
/// address bounces/envelope-sender rewrites should use.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Expansion {
    pub destinations: Vec<Destination>,
    pub owner_override: Option<String>,
}

impl AliasTable {
    pub fn new(entries: HashMap<String, Vec<Destination>>) -> AliasTable {
        let owners = entries
            .keys()
            .filter_map(|name| {
                let owner_key = format!("owner-{}", name);
                entries.get(&owner_key).and_then(|dests| match dests.as_slice() {
                    [Destination::Address(addr)] => Some((name.clone(), addr.clone())),
                    _ => None,
                })
            })
            .collect();
        AliasTable { entries, owners }
    }

    /// Looks up `name`, recursively expanding any alias destinations it
    /// contains. Returns `None` if `name` has no alias entry at all, so the
    /// caller can fall through to user delivery; self-reference during
    /// expansion does the same (spec's stated historical semantics),
    /// rather than being treated as an error.
    pub fn expand(&self, name: &str) -> Result<Option<Expansion>, AliasError> {
        let Some(initial) = self.entries.get(name) else {
            return Ok(None);
        };

        let mut out = Vec::new();
        let mut owner_override = self.owners.get(name).cloned();
        let mut seen = vec![name.to_owned()];
        self.expand_into(initial, &mut seen, &mut out, &mut owner_override, 0)?;
        Ok(Some(Expansion {
            destinations: out,
            owner_override,
        }))
    }

    fn expand_into(
        &self,
        destinations: &[Destination],
        seen: &mut Vec<String>,
        out: &mut Vec<Destination>,
        owner_override: &mut Option<String>,
        depth: u32,
    ) -> Result<(), AliasError> {
        if depth >= MAX_DEPTH {
            return Err(AliasError::DepthExceeded(MAX_DEPTH));
        }
        for dest in destinations {
            match dest {
                Destination::Address(addr) => match self.entries.get(addr) {
                    None => out.push(Destination::Address(addr.clone())),
                    Some(nested) => {
                        if seen.iter().any(|s| s == addr) {
                            // Self-reference: this branch falls through to
                            // plain user delivery instead of recursing.
                            out.push(Destination::Address(addr.clone()));
                            continue;
                        }
                        if owner_override.is_none() {
                            if let Some(owner) = self.owners.get(addr) {
                                *owner_override = Some(owner.clone());
                            }
                        }
                        seen.push(addr.clone());
                        self.expand_into(nested, seen, out, owner_override, depth + 1)?;
                        seen.pop();
                    }
                },
                other => out.push(other.clone()),
            }
        }
        Ok(())
    }
}
