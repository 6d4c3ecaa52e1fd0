use marc_core::domain::{
    ActionItem, AgendaItem, DecisionItem, Document, EntityKind, EntityRef, Meeting, Person,
    PersonRole, Workgroup,
};
use marc_core::error::ErrorKind;
use marc_core::store::{EntityStore, Filter};
use pretty_assertions::assert_eq;

fn person(id: &str, name: &str) -> Person {
    Person {
        id: id.to_string(),
        display_name: name.to_string(),
        aliases: vec![],
        role: PersonRole::Participant,
    }
}

fn meeting(id: &str, workgroup_id: &str, host: Option<&str>) -> Meeting {
    Meeting {
        id: id.to_string(),
        workgroup_id: workgroup_id.to_string(),
        date: "2024-03-15".to_string(),
        host_id: host.map(|h| h.to_string()),
        documenter_id: None,
        purpose: None,
        attendee_ids: vec![],
        tags: vec![],
        transcript: "Budget approved".to_string(),
        source_sha256: "00".to_string(),
    }
}

/// Workgroup wg, persons p1/p2, meeting m1 with one document and one agenda item holding a
/// decision and an action assigned to p2.
fn seed(store: &EntityStore) {
    let mut txn = store.begin();
    txn.put(Workgroup {
        id: "wg".to_string(),
        name: "Treasury".to_string(),
    })
    .put(person("p1", "Alice Nguyen"))
    .put(person("p2", "Bob Smith"))
    .put(meeting("m1", "wg", Some("p1")))
    .put(Document {
        id: "m1-doc-0".to_string(),
        meeting_id: "m1".to_string(),
        title: "Ledger".to_string(),
        link: None,
    })
    .put(AgendaItem {
        id: "m1-agenda-0".to_string(),
        meeting_id: "m1".to_string(),
        status: Some("done".to_string()),
        narrative: None,
    })
    .put(DecisionItem {
        id: "m1-agenda-0-decision-0".to_string(),
        agenda_item_id: "m1-agenda-0".to_string(),
        decision: "Budget approved".to_string(),
        rationale: None,
        effect: None,
    })
    .put(ActionItem {
        id: "m1-agenda-0-action-0".to_string(),
        agenda_item_id: "m1-agenda-0".to_string(),
        text: "Publish ledger".to_string(),
        assignee_id: Some("p2".to_string()),
        due_date: None,
        status: None,
    });
    txn.commit().expect("seed commit");
}

#[test]
fn deleting_a_meeting_removes_the_whole_subtree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");
    seed(&store);

    let mut removed = store.delete(EntityKind::Meeting, "m1").expect("delete");
    removed.sort();
    let mut expected = vec![
        EntityRef::new(EntityKind::Meeting, "m1"),
        EntityRef::new(EntityKind::Document, "m1-doc-0"),
        EntityRef::new(EntityKind::AgendaItem, "m1-agenda-0"),
        EntityRef::new(EntityKind::DecisionItem, "m1-agenda-0-decision-0"),
        EntityRef::new(EntityKind::ActionItem, "m1-agenda-0-action-0"),
    ];
    expected.sort();
    assert_eq!(removed, expected);

    let counts = store.counts().expect("counts");
    for kind in [
        EntityKind::Meeting,
        EntityKind::Document,
        EntityKind::AgendaItem,
        EntityKind::DecisionItem,
        EntityKind::ActionItem,
    ] {
        assert_eq!(counts[&kind], 0, "{kind} left behind");
    }
    // Persons and workgroups are never cascade-deleted.
    assert_eq!(counts[&EntityKind::Person], 2);
    assert_eq!(counts[&EntityKind::Workgroup], 1);

    let report = store.check_consistency().expect("consistency");
    assert!(report.is_consistent(), "{report:?}");

    let meetings: Vec<Meeting> = store.query(&Filter::Owner("wg".to_string())).expect("query");
    assert!(meetings.is_empty());
    let assigned: Vec<ActionItem> = store
        .query(&Filter::ReferencesPerson("p2".to_string()))
        .expect("query");
    assert!(assigned.is_empty());

    let persisted = std::fs::read_to_string(dir.path().join("indices/person_refs.json")).expect("read");
    assert!(!persisted.contains("m1"), "stale index entry: {persisted}");
}

#[test]
fn deleting_an_agenda_item_only_takes_its_own_children() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");
    seed(&store);

    let removed = store
        .delete(EntityKind::AgendaItem, "m1-agenda-0")
        .expect("delete");
    assert_eq!(removed.len(), 3);
    assert!(store.exists(EntityKind::Meeting, "m1").expect("exists"));
    assert!(store.exists(EntityKind::Document, "m1-doc-0").expect("exists"));
    assert!(store.check_consistency().expect("consistency").is_consistent());
}

#[test]
fn referenced_people_and_populated_workgroups_cannot_be_deleted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");
    seed(&store);

    let err = store.delete(EntityKind::Person, "p2").unwrap_err();
    assert!(err.is(ErrorKind::ReferentialIntegrity));
    assert_eq!(err.code, "STORE_DELETE_RESTRICTED");

    let err = store.delete(EntityKind::Workgroup, "wg").unwrap_err();
    assert_eq!(err.code, "STORE_DELETE_RESTRICTED");

    // Once the meeting is gone both become deletable.
    store.delete(EntityKind::Meeting, "m1").expect("delete meeting");
    store.delete(EntityKind::Person, "p2").expect("delete person");
    store.delete(EntityKind::Workgroup, "wg").expect("delete workgroup");
    assert!(store.check_consistency().expect("consistency").is_consistent());
}

#[test]
fn replacing_a_meeting_drops_children_that_are_not_re_put() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");
    seed(&store);

    let fresh = vec![
        meeting("m1", "wg", Some("p1")).into(),
        AgendaItem {
            id: "m1-agenda-0".to_string(),
            meeting_id: "m1".to_string(),
            status: Some("reopened".to_string()),
            narrative: None,
        }
        .into(),
    ];
    let summary = store.replace_meeting("m1", fresh).expect("replace");
    assert_eq!(summary.written.len(), 2);
    assert_eq!(summary.deleted.len(), 3);

    let items: Vec<AgendaItem> = store.query(&Filter::Owner("m1".to_string())).expect("query");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status.as_deref(), Some("reopened"));
    assert!(!store.exists(EntityKind::Document, "m1-doc-0").expect("exists"));
    assert!(store.check_consistency().expect("consistency").is_consistent());
}

#[test]
fn deleting_a_missing_entity_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");
    let err = store.delete(EntityKind::Meeting, "ghost").unwrap_err();
    assert!(err.is(ErrorKind::NotFound));
}

#[test]
fn rebuild_restores_tampered_index_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");
    seed(&store);

    std::fs::write(dir.path().join("indices/meetings_by_workgroup.json"), "{}").expect("tamper");
    let report = store.check_consistency().expect("consistency");
    assert_eq!(report.divergent, vec!["meetings_by_workgroup".to_string()]);

    store.rebuild_indices().expect("rebuild");
    assert!(store.check_consistency().expect("consistency").is_consistent());
}

const SUBTREE_KINDS: [EntityKind; 5] = [
    EntityKind::Meeting,
    EntityKind::Document,
    EntityKind::AgendaItem,
    EntityKind::DecisionItem,
    EntityKind::ActionItem,
];

#[test]
fn concurrent_commits_to_disjoint_meetings_all_land() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");
    seed(&store);

    std::thread::scope(|s| {
        for i in 0..8 {
            let store = &store;
            s.spawn(move || {
                let id = format!("t{i}");
                let mut txn = store.begin();
                txn.put(meeting(&id, "wg", Some("p1"))).put(AgendaItem {
                    id: format!("{id}-agenda-0"),
                    meeting_id: id.clone(),
                    status: None,
                    narrative: None,
                });
                txn.commit().expect("threaded commit");
            });
        }
    });

    let counts = store.counts().expect("counts");
    assert_eq!(counts[&EntityKind::Meeting], 9);
    assert_eq!(counts[&EntityKind::AgendaItem], 9);
    let in_wg: Vec<Meeting> = store.query(&Filter::Owner("wg".to_string())).expect("query");
    assert_eq!(in_wg.len(), 9);
    assert!(store.check_consistency().expect("consistency").is_consistent());
}

#[test]
fn readers_see_a_cascade_whole_or_not_at_all() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let dir = tempfile::tempdir().expect("tempdir");
    let store = EntityStore::open(dir.path()).expect("open");
    seed(&store);
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut observations = 0usize;
            loop {
                let finished = done.load(Ordering::SeqCst);
                let counts = store.counts().expect("counts");
                let sizes: Vec<usize> = SUBTREE_KINDS.iter().map(|k| counts[k]).collect();
                assert!(
                    sizes == vec![1; 5] || sizes == vec![0; 5],
                    "partial cascade observed: {sizes:?}"
                );
                let items: Vec<AgendaItem> = store
                    .query(&Filter::Owner("m1".to_string()))
                    .expect("owner query never sees a stale index");
                assert!(items.len() <= 1);
                observations += 1;
                if finished {
                    return observations;
                }
            }
        });
        s.spawn(|| {
            store.delete(EntityKind::Meeting, "m1").expect("delete");
            done.store(true, Ordering::SeqCst);
        });
        assert!(reader.join().expect("reader") >= 1);
    });

    assert_eq!(store.counts().expect("counts")[&EntityKind::Meeting], 0);
}
