//! End-to-end behaviour of the branched message store on a real repository.

use std::sync::Arc;
use std::time::Duration;

use bookchat_core::{ArchiveConfig, BranchRef, Clock, MessageId, format_timestamp, truncate_to_micros};
use bookchat_storage::{
    ArchiveManager, FileLock, PinBoard, RepositoryError, StoreError, encode_message,
};
use bookchat_storage::testing::{self, replica};

#[test]
fn alice_then_bob_in_time_order() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, false).unwrap();

    r.store.append("alice", "hello").unwrap();
    r.clock.advance(Duration::from_secs(1));
    r.store.append("bob", "hi").unwrap();

    let all = r.store.list_all().unwrap();
    let view: Vec<(&str, &str)> = all
        .iter()
        .map(|m| (m.author.as_str(), m.content.as_str()))
        .collect();
    assert_eq!(view, vec![("alice", "hello"), ("bob", "hi")]);
}

#[test]
fn ordering_ignores_branch_enumeration_order() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, false).unwrap();

    // branch names sort zed > mid > amy, timestamps the other way round
    for (author, content) in [("zed", "first"), ("mid", "second"), ("amy", "third")] {
        r.store.append(author, content).unwrap();
        r.clock.advance(Duration::from_millis(10));
    }
    let contents: Vec<String> = r
        .store
        .list_all()
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
}

#[test]
fn signed_messages_verify_and_unsigned_do_not() {
    let tmp = tempfile::tempdir().unwrap();
    let signed = replica(&tmp.path().join("a"), None, true).unwrap();
    let m = signed.store.append("alice", "signed hello").unwrap();
    assert!(m.verified);
    let listed = signed.store.list_all().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].verified);
    assert_eq!(listed[0].signature, m.signature);

    // the public key history is published on the author's branch
    let keys = signed
        .driver
        .read_file("user/alice", "keys/alice.json")
        .unwrap()
        .expect("published keys");
    assert!(String::from_utf8(keys).unwrap().contains("\"ed25519\""));

    let unsigned = replica(&tmp.path().join("b"), None, false).unwrap();
    let m = unsigned.store.append("alice", "plain hello").unwrap();
    assert!(!m.verified);
    assert!(!unsigned.store.list_all().unwrap()[0].verified);
}

#[test]
fn ensure_branch_twice_is_one_branch() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, false).unwrap();
    assert!(r.store.ensure_branch("alice").unwrap());
    assert!(!r.store.ensure_branch("alice").unwrap());
    assert_eq!(r.driver.list_branches("user/").unwrap(), vec!["user/alice"]);
}

#[test]
fn corrupt_and_foreign_files_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, false).unwrap();
    let good = r.store.append("alice", "good").unwrap();

    let branch = BranchRef::for_author("alice").unwrap();
    let now = truncate_to_micros(r.clock.now_utc());
    let corrupt = MessageId::with_suffix("alice", &now, 1);
    let forged = MessageId::with_suffix("alice", &now, 2);
    let foreign_id = MessageId::with_suffix("mallory", &now, 3);
    r.driver
        .with_branch(&branch.name(), |s| -> Result<(), RepositoryError> {
            s.write_file(&branch.message_path(&corrupt.file_name()), b"no trailer here")?;
            s.write_file(
                &branch.message_path(&forged.file_name()),
                encode_message("mallory", &now, "forged", None).as_bytes(),
            )?;
            s.write_file(
                &branch.message_path(&foreign_id.file_name()),
                encode_message("mallory", &now, "wrong branch", None).as_bytes(),
            )?;
            s.write_file(&branch.message_path("README.md"), b"not a message")?;
            s.commit("test: add junk", None)?;
            Ok(())
        })
        .unwrap();

    let all = r.store.list_all().unwrap();
    assert_eq!(all, vec![good]);
    assert!(matches!(
        r.store.get_by_file("alice", &corrupt.file_name()),
        Err(StoreError::Parse { .. })
    ));
}

#[test]
fn tampered_content_is_listed_unverified() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, true).unwrap();
    let m = r.store.append("alice", "original").unwrap();
    let branch = BranchRef::for_author("alice").unwrap();
    let path = branch.message_path(&m.file_name());

    let tampered = encode_message("alice", &m.created_at, "tampered", m.signature.as_deref());
    r.driver
        .with_branch(&branch.name(), |s| -> Result<(), RepositoryError> {
            s.write_file(&path, tampered.as_bytes())?;
            s.commit("test: tamper", None)?;
            Ok(())
        })
        .unwrap();

    let all = r.store.list_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].content, "tampered");
    assert!(!all[0].verified);
}

#[test]
fn failed_append_leaves_nothing_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = testing::settings(&tmp.path().join("repo"), None);
    settings.lock_timeout = Duration::from_millis(200);
    let r = testing::replica_with(settings, &tmp.path().join("keys"), false).unwrap();

    let mut held = FileLock::new(r.driver.root().join(".git/bookchat-worktree.lock"));
    held.acquire().unwrap();
    let err = r.store.append("alice", "blocked").unwrap_err();
    assert_eq!(err.error_type(), "LOCK_TIMEOUT");
    assert!(err.is_recoverable());
    held.release();

    assert_eq!(r.driver.current_branch().unwrap().as_deref(), Some("main"));
    assert!(r.store.list_all().unwrap().is_empty());
    assert!(!r.driver.root().join("messages").exists());

    r.store.append("alice", "after").unwrap();
    assert_eq!(r.store.list_all().unwrap().len(), 1);
}

#[test]
fn line_endings_and_non_ascii_survive_byte_for_byte() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, true).unwrap();
    let contents = [
        "line one\r\nline two",
        "lone\rcarriage return",
        "trailing crlf\r\n",
        "ünïcødé ✓ 日本語\r\n-- \r\nnot a trailer",
    ];
    for content in contents {
        r.store.append("alice", content).unwrap();
        r.clock.advance(Duration::from_millis(1));
    }

    let all = r.store.list_all().unwrap();
    let listed: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(listed, contents);
    assert!(all.iter().all(|m| m.verified));

    let first = r.store.get_by_id(all[0].id.as_str()).unwrap();
    assert_eq!(first.content.as_bytes(), contents[0].as_bytes());
    assert!(first.verified);
}

#[test]
fn timestamp_is_taken_once_the_worktree_lock_is_held() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, false).unwrap();
    let before = r.store.append("alice", "first").unwrap();

    let mut held = FileLock::new(r.driver.root().join(".git/bookchat-worktree.lock"));
    held.acquire().unwrap();
    let blocked = std::thread::scope(|scope| {
        let store = Arc::clone(&r.store);
        let waiter = scope.spawn(move || store.append("alice", "second").unwrap());
        std::thread::sleep(Duration::from_millis(150));
        r.clock.advance(Duration::from_secs(5));
        held.release();
        waiter.join().unwrap()
    });

    assert!(blocked.created_at >= before.created_at + chrono::Duration::seconds(5));
    let history = r.store.history("alice", 2).unwrap();
    assert!(history[0].summary.contains(blocked.id.as_str()));
    assert!(history[1].summary.contains(before.id.as_str()));
    let contents: Vec<String> = r.store.list_all().unwrap().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["first", "second"]);
}

#[test]
fn concurrent_appends_are_serialized() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, false).unwrap();
    let authors = ["ann", "ben", "cat", "dan"];

    std::thread::scope(|scope| {
        for author in authors {
            let store = Arc::clone(&r.store);
            scope.spawn(move || {
                for i in 0..5 {
                    store.append(author, &format!("{author} {i}")).unwrap();
                }
            });
        }
    });

    let all = r.store.list_all().unwrap();
    assert_eq!(all.len(), 20);
    for author in authors {
        assert_eq!(all.iter().filter(|m| m.author == author).count(), 5);
    }
    assert_eq!(r.driver.current_branch().unwrap().as_deref(), Some("main"));
}

#[test]
fn archived_messages_stay_visible() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, true).unwrap();
    let old = r.store.append("alice", "old news").unwrap();
    r.clock.advance(Duration::from_secs(40 * 24 * 3600));
    let fresh = r.store.append("alice", "fresh").unwrap();

    let archive = ArchiveManager::new(
        Arc::clone(&r.store),
        ArchiveConfig {
            enabled: true,
            max_age: chrono::Duration::days(30),
            max_branch_bytes: 1 << 20,
            interval: Duration::from_secs(3600),
        },
    );
    let report = archive.run_once().unwrap();
    assert_eq!(report.messages_moved, 1);
    assert_eq!(report.branches_archived, 1);
    assert!(report.failures.is_empty());

    let all = r.store.list_all().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, old.id);
    assert!(all[0].archived);
    assert_eq!(all[0].content, old.content);
    assert_eq!(all[0].signature, old.signature);
    assert!(all[0].verified);
    assert_eq!(all[1].id, fresh.id);
    assert!(!all[1].archived);

    let looked_up = r.store.get_by_id(old.id.as_str()).unwrap();
    assert!(looked_up.archived);

    let meta = &r.store.authors().unwrap()[0];
    assert_eq!(meta.message_count, 1);
    assert_eq!(meta.archived_count, 1);

    let history = r.store.history("alice", 1).unwrap();
    assert_eq!(history[0].summary, "archive: move 1 messages for alice");

    // a second run has nothing left to move
    assert_eq!(archive.run_once().unwrap().messages_moved, 0);
}

#[test]
fn pins_resolve_to_messages() {
    let tmp = tempfile::tempdir().unwrap();
    let r = replica(tmp.path(), None, false).unwrap();
    let m = r.store.append("alice", "pin me").unwrap();
    let board = PinBoard::new(Arc::clone(&r.driver), r.clock.clone());

    board.pin("msg-1", "alice").unwrap();
    board.pin("msg-1", "alice").unwrap();
    board.pin(m.id.as_str(), "bob").unwrap();

    let pins = board.list_pinned().unwrap();
    assert_eq!(pins.iter().filter(|p| p.message_id == "msg-1").count(), 1);
    assert_eq!(pins.len(), 2);

    let joined = board.pinned_messages(&r.store).unwrap();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].1, m);
    assert_eq!(joined[0].0.pinned_by, "bob");

    // pins live on main and never leak into author branches
    assert!(r.driver.read_file("main", "pins.json").unwrap().is_some());
    assert!(r.driver.read_file("user/alice", "pins.json").unwrap().is_none());
    assert!(format_timestamp(&pins[0].pinned_at).ends_with('Z'));
}
