use std::fs;

use marc_ai::audit::{AuditLog, AuditRecordInput, QueryOutcome};
use marc_ai::providers::{Degradation, Stage};
use marc_core::error::ErrorKind;
use pretty_assertions::assert_eq;

fn input(query_id: &str, answer: &str) -> AuditRecordInput {
    AuditRecordInput {
        query_id: query_id.to_string(),
        query_text: "What was decided about budget?".to_string(),
        answer_text: answer.to_string(),
        citations: vec!["[m1 | 2024-03-15 | Alice Nguyen (inferred)]".to_string()],
        outcome: QueryOutcome::Answered,
        generator: Some("template".to_string()),
        model_version: "template-v1".to_string(),
        embedding_version: "hashing-v1".to_string(),
        index_generation: "gen-0123456789abcdef".to_string(),
        degradations: vec![Degradation {
            stage: Stage::Generation,
            provider: "remote".to_string(),
            code: "AI_REMOTE_GENERATE_FAILED".to_string(),
            message: "Remote provider unreachable".to_string(),
        }],
    }
}

#[test]
fn entries_are_hashed_and_verifiable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = AuditLog::open(dir.path().join("audit")).expect("open");

    let entry = log.record(input("q-1", "Budget approved.")).expect("record");
    assert_eq!(entry.answer_sha256.len(), 64);
    assert_eq!(entry.entry_sha256.len(), 64);
    assert!(entry.timestamp.ends_with('Z'));

    let loaded = log.load("q-1").expect("load");
    assert_eq!(loaded, entry);
    assert_eq!(log.verify("q-1").expect("verify"), entry);
}

#[test]
fn existing_entries_are_never_overwritten() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = AuditLog::open(dir.path().join("audit")).expect("open");
    log.record(input("q-1", "first")).expect("record");

    let err = log.record(input("q-1", "second")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AuditWriteFailure);
    assert_eq!(err.code, "AUDIT_ENTRY_EXISTS");
    assert_eq!(log.load("q-1").expect("load").answer_text, "first");

    // No temp files are left behind.
    let names: Vec<String> = fs::read_dir(log.dir())
        .expect("read dir")
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["q-1.json".to_string()]);
}

#[test]
fn tampering_is_detected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = AuditLog::open(dir.path().join("audit")).expect("open");
    log.record(input("q-1", "Budget approved.")).expect("record");
    log.record(input("q-2", "Budget approved.")).expect("record");

    let path = log.dir().join("q-1.json");
    let text = fs::read_to_string(&path).expect("read");
    fs::write(&path, text.replace("Budget approved.", "Budget rejected.")).expect("write");
    let err = log.verify("q-1").unwrap_err();
    assert_eq!(err.kind, ErrorKind::HashMismatch);

    let path = log.dir().join("q-2.json");
    let text = fs::read_to_string(&path).expect("read");
    fs::write(&path, text.replace("hashing-v1", "hashing-v2")).expect("write");
    let err = log.verify("q-2").unwrap_err();
    assert_eq!(err.code, "AUDIT_HASH_MISMATCH");
}

#[test]
fn list_is_ordered_by_query_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = AuditLog::open(dir.path().join("audit")).expect("open");
    for id in ["q-b", "q-c", "q-a"] {
        log.record(input(id, "x")).expect("record");
    }
    let ids: Vec<String> = log
        .list()
        .expect("list")
        .into_iter()
        .map(|e| e.query_id)
        .collect();
    assert_eq!(ids, vec!["q-a", "q-b", "q-c"]);
    assert_eq!(log.load("missing").unwrap_err().kind, ErrorKind::NotFound);
}
