//! End-to-end tests wiring the real `mta-*` crates together, covering the
//! spec §8 scenario table: a plain submission landing cleanly in the
//! queue, list-alias fan-out with a self-referencing member, the
//! executable-destination mailbox bounce, and a multi-recipient defer
//! side file with its tombstone/notification cycle.

use std::collections::HashMap;

use mta_cleanup::{lookup::FileTable, lookup::LookupTable, CleanupContext, Submission};
use mta_local::{
    alias::{AliasTable, Destination},
    deliver_recipient,
    dup_filter::DuplicateFilter,
    Account, AccountLookup, Config as LocalConfig,
};
use mta_queue::QueueRoot;
use mta_types::{QueueDir, RecordType};

struct FixedAccounts(HashMap<String, Account>);

impl AccountLookup for FixedAccounts {
    fn lookup(&self, user: &str) -> Option<Account> {
        self.0.get(user).cloned()
    }
}

fn account(dir: &std::path::Path, name: &str) -> Account {
    Account {
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        mailbox_path: dir.join(name),
        is_home_mailbox: true,
        spool_dir: None,
    }
}

/// Scenario 1 (spec §8): a plain submission lands in `incoming` with its
/// envelope intact, and nothing is left behind in `maildrop`.
#[test]
fn submission_lands_in_incoming_with_canonical_envelope() {
    let dir = tempdir::TempDir::new("mta-integration").unwrap();
    let queue = QueueRoot::new(dir.path(), false).unwrap();

    let one_to_one: Vec<Box<dyn LookupTable>> = vec![];
    let one_to_many: Vec<Box<dyn LookupTable>> = vec![];
    let mut ctx = CleanupContext::new(&one_to_one, &one_to_many);

    let submission = Submission {
        sender: Some("a@x".to_owned()),
        sender_full_name: Some("Alice Example".to_owned()),
        recipients: vec!["b@y".to_owned()],
        content: b"From: a@x\r\nSubject: hi\r\n\r\nhello world\r\n".to_vec(),
    };

    let id = mta_cleanup::process(&mut ctx, &submission, &queue, None).unwrap();

    assert!(queue.open(QueueDir::Maildrop, &id, false).is_err());
    let mut reader = queue.open(QueueDir::Incoming, &id, false).unwrap();
    let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();

    let rcpts: Vec<_> = records
        .iter()
        .filter(|r| r.ty == RecordType::Rcpt)
        .map(|r| String::from_utf8(r.payload.clone()).unwrap())
        .collect();
    assert_eq!(rcpts, vec!["b@y".to_owned()]);
    assert!(records.iter().any(|r| r.ty == RecordType::End));
}

/// Scenario 3 (spec §8): `list@x -> alice@x, bob@x, list@x` expands
/// without looping, delivering to alice and bob through the alias and to
/// the `list` mailbox itself through the self-reference fallback.
#[test]
fn list_alias_with_self_reference_delivers_all_three_branches() {
    let dir = tempdir::TempDir::new("mta-integration").unwrap();
    let mut accounts = HashMap::new();
    accounts.insert("alice@x".to_owned(), account(dir.path(), "alice"));
    accounts.insert("bob@x".to_owned(), account(dir.path(), "bob"));
    accounts.insert("list@x".to_owned(), account(dir.path(), "list"));
    let accounts = FixedAccounts(accounts);

    let mut entries = HashMap::new();
    entries.insert(
        "list@x".to_owned(),
        vec![
            Destination::Address("alice@x".to_owned()),
            Destination::Address("bob@x".to_owned()),
            Destination::Address("list@x".to_owned()),
        ],
    );
    let aliases = AliasTable::new(entries);
    let config = LocalConfig {
        aliases: &aliases,
        accounts: &accounts,
        alias_db_is_root_owned: false,
        dotlock: false,
    };
    let mut dup_filter = DuplicateFilter::default();

    let results = deliver_recipient("list@x", b"announcement\n", &config, &mut dup_filter).unwrap();
    let labels: Vec<_> = results.iter().map(|(label, _)| label.clone()).collect();
    assert_eq!(labels, vec!["alice@x", "bob@x", "list@x"]);
    assert!(results.iter().all(|(_, outcome)| *outcome == mta_local::Outcome::Delivered));

    assert_eq!(std::fs::read(dir.path().join("alice")).unwrap(), b"announcement\n");
    assert_eq!(std::fs::read(dir.path().join("bob")).unwrap(), b"announcement\n");
    assert_eq!(std::fs::read(dir.path().join("list")).unwrap(), b"announcement\n");
}

/// Scenario 4 (spec §8): delivery to a mailbox file that already exists
/// with an execute bit set is a permanent bounce, and no content is
/// written.
#[test]
fn executable_destination_file_bounces_without_writing() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir::TempDir::new("mta-integration").unwrap();
    let mailbox = dir.path().join("alice");
    std::fs::write(&mailbox, b"#!/bin/sh\necho hi\n").unwrap();
    std::fs::set_permissions(&mailbox, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut accounts = HashMap::new();
    accounts.insert("alice@x".to_owned(), account(dir.path(), "alice"));
    let accounts = FixedAccounts(accounts);
    let aliases = AliasTable::new(HashMap::new());
    let config = LocalConfig {
        aliases: &aliases,
        accounts: &accounts,
        alias_db_is_root_owned: false,
        dotlock: false,
    };
    let mut dup_filter = DuplicateFilter::default();

    let results = deliver_recipient("alice@x", b"should not land\n", &config, &mut dup_filter).unwrap();
    assert_eq!(results, vec![("alice@x".to_owned(), mta_local::Outcome::Bounced)]);

    let contents = std::fs::read(&mailbox).unwrap();
    assert_eq!(contents, b"#!/bin/sh\necho hi\n");
}

/// Scenario 5 (spec §8): three recipients all defer; the side file holds
/// three records, and tombstoning one (once the retry eventually
/// succeeds) leaves the other two intact.
#[test]
fn defer_side_file_holds_one_record_per_recipient_and_tombstones_independently() {
    let dir = tempdir::TempDir::new("mta-integration").unwrap();
    let mut side_file = mta_bounce::SideFile::open(dir.path(), mta_bounce::Kind::Defer, "ABCDEF01").unwrap();
    side_file.append("alice@y", "451 greylisted").unwrap();
    side_file.append("bob@y", "connection timed out").unwrap();
    side_file.append("carol@y", "451 greylisted").unwrap();

    let records = side_file.read_all().unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == "4.0.0"));

    side_file.delete_record(&records[1]).unwrap();
    let remaining = side_file.read_all().unwrap();
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].recipient, "alice@y");
    assert_eq!(remaining[1].recipient, "carol@y");
}

/// A bounce notification, once composed, re-enters the system through
/// Cleanup under the reserved null-sender identity (spec §7/§4.8) and
/// lands in `incoming` like any other message.
#[test]
fn bounce_notification_resubmits_through_cleanup_with_empty_reverse_path() {
    let dir = tempdir::TempDir::new("mta-integration").unwrap();
    let queue = QueueRoot::new(dir.path(), false).unwrap();

    let forged = vec![mta_bounce::Record::forge("b@y", "5.1.1", "user unknown")];
    let submission_spec = mta_bounce::build_notification("a@x", "ABCDEF01", &forged).unwrap();
    assert_eq!(submission_spec.sender, Some(String::new()));

    let submission = Submission {
        sender: submission_spec.sender,
        sender_full_name: submission_spec.sender_full_name,
        recipients: submission_spec.recipients,
        content: submission_spec.content,
    };

    let one_to_one: Vec<Box<dyn LookupTable>> = vec![];
    let one_to_many: Vec<Box<dyn LookupTable>> = vec![];
    let mut ctx = CleanupContext::new(&one_to_one, &one_to_many);
    let id = mta_cleanup::process(&mut ctx, &submission, &queue, None).unwrap();

    let mut reader = queue.open(QueueDir::Incoming, &id, false).unwrap();
    let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();
    let from = records.iter().find(|r| r.ty == RecordType::From).unwrap();
    assert_eq!(from.payload, b"");
    let rcpts: Vec<_> = records
        .iter()
        .filter(|r| r.ty == RecordType::Rcpt)
        .map(|r| String::from_utf8(r.payload.clone()).unwrap())
        .collect();
    assert_eq!(rcpts, vec!["a@x".to_owned()]);
}

/// Recipient mapping (one-to-one canonicalisation) followed by expansion
/// (one-to-many alias) both run inside Cleanup before a file ever reaches
/// `incoming`, so a submission addressed to a pre-canonicalisation alias
/// resolves to its final members only.
#[test]
fn mapping_then_expansion_resolves_before_the_file_is_committed() {
    let dir = tempdir::TempDir::new("mta-integration").unwrap();
    let queue = QueueRoot::new(dir.path(), false).unwrap();

    let one_to_one: Vec<Box<dyn LookupTable>> =
        vec![Box::new(FileTable::from_pairs("canon", &[("old@y", "list@y")]))];
    let one_to_many: Vec<Box<dyn LookupTable>> = vec![Box::new(FileTable::from_pairs(
        "aliases",
        &[("list@y", "alice@y,bob@y")],
    ))];
    let mut ctx = CleanupContext::new(&one_to_one, &one_to_many);

    let submission = Submission {
        sender: Some("a@x".to_owned()),
        sender_full_name: None,
        recipients: vec!["old@y".to_owned()],
        content: b"Subject: hi\r\n\r\nbody\r\n".to_vec(),
    };
    let id = mta_cleanup::process(&mut ctx, &submission, &queue, None).unwrap();

    let mut reader = queue.open(QueueDir::Incoming, &id, false).unwrap();
    let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();
    let rcpts: Vec<_> = records
        .iter()
        .filter(|r| r.ty == RecordType::Rcpt)
        .map(|r| String::from_utf8(r.payload.clone()).unwrap())
        .collect();
    assert_eq!(rcpts, vec!["alice@y".to_owned(), "bob@y".to_owned()]);
}
