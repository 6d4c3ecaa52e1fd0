use marc_core::domain::{
    ActionItem, AgendaItem, Document, EntityKind, Meeting, Workgroup,
};
use marc_core::error::ErrorKind;
use marc_core::store::EntityStore;
use pretty_assertions::assert_eq;

fn meeting(id: &str, workgroup_id: &str) -> Meeting {
    Meeting {
        id: id.to_string(),
        workgroup_id: workgroup_id.to_string(),
        date: "2024-03-15".to_string(),
        host_id: None,
        documenter_id: None,
        purpose: None,
        attendee_ids: vec![],
        tags: vec![],
        transcript: String::new(),
        source_sha256: String::new(),
    }
}

fn total(store: &EntityStore) -> usize {
    store.counts().expect("counts").values().sum()
}

#[test]
fn save_with_dangling_owner_fails_and_persists_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");

    let err = store
        .save(Document {
            id: "d1".to_string(),
            meeting_id: "m-missing".to_string(),
            title: "Orphan".to_string(),
            link: None,
        })
        .unwrap_err();
    assert!(err.is(ErrorKind::ReferentialIntegrity));
    assert_eq!(err.code, "STORE_FK_UNRESOLVED");
    assert!(err.details.unwrap_or_default().contains("missing=meeting:m-missing"));

    assert_eq!(total(&store), 0);
    let journal = std::fs::read_dir(dir.path().join("journal"))
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(journal, 0);
}

#[test]
fn one_bad_reference_aborts_the_whole_transaction() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");

    let mut txn = store.begin();
    txn.put(Workgroup {
        id: "wg".to_string(),
        name: "Treasury".to_string(),
    })
    .put(meeting("m1", "wg"))
    .put(AgendaItem {
        id: "a1".to_string(),
        meeting_id: "m1".to_string(),
        status: None,
        narrative: None,
    })
    .put(ActionItem {
        id: "x1".to_string(),
        agenda_item_id: "a1".to_string(),
        text: "Follow up".to_string(),
        assignee_id: Some("person-unknown".to_string()),
        due_date: None,
        status: None,
    });
    let err = txn.commit().unwrap_err();
    assert_eq!(err.code, "STORE_FK_UNRESOLVED");
    assert_eq!(total(&store), 0);
}

#[test]
fn staged_parents_satisfy_references_in_the_same_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");

    let mut txn = store.begin();
    txn.put(meeting("m1", "wg")).put(Workgroup {
        id: "wg".to_string(),
        name: "Treasury".to_string(),
    });
    let summary = txn.commit().expect("commit");
    assert_eq!(summary.written.len(), 2);
    assert!(store.exists(EntityKind::Meeting, "m1").expect("exists"));
}

#[test]
fn a_put_cannot_point_at_something_deleted_in_the_same_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");
    let mut txn = store.begin();
    txn.put(Workgroup {
        id: "wg".to_string(),
        name: "Treasury".to_string(),
    })
    .put(meeting("m1", "wg"));
    txn.commit().expect("seed");

    let mut txn = store.begin();
    txn.delete_cascade(EntityKind::Meeting, "m1").put(Document {
        id: "d1".to_string(),
        meeting_id: "m1".to_string(),
        title: "Late doc".to_string(),
        link: None,
    });
    let err = txn.commit().unwrap_err();
    assert!(err.is(ErrorKind::ReferentialIntegrity));
    assert!(store.exists(EntityKind::Meeting, "m1").expect("exists"));
    assert!(!store.exists(EntityKind::Document, "d1").expect("exists"));
}
