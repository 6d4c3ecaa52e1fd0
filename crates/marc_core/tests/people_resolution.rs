use marc_core::config::{PersonMatchPolicy, Settings};
use marc_core::domain::{EntityKind, Meeting, Person};
use marc_core::ingest::Ingestor;
use marc_core::people::FlagReason;
use marc_core::store::{EntityStore, Filter};
use pretty_assertions::assert_eq;

fn legacy(id: &str, participants: &[&str]) -> String {
    serde_json::json!({
        "id": id,
        "date": "2024-01-10",
        "participants": participants,
        "transcript": format!("{}: notes for {id}", participants[0]),
    })
    .to_string()
}

#[test]
fn flag_only_keeps_near_duplicates_apart_and_persists_the_flag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let store = EntityStore::open(settings.store_dir()).expect("open");
    let ingestor = Ingestor::new(&store, &settings);

    ingestor
        .ingest_json("a", &legacy("m1", &["Jonathan Smith"]))
        .expect("m1");
    let second = ingestor
        .ingest_json("b", &legacy("m2", &["Jonathon Smith"]))
        .expect("m2");
    assert_eq!(second.person_flags.len(), 1);
    assert_eq!(second.person_flags[0].reason, FlagReason::NearDuplicate);

    assert_eq!(store.counts().expect("counts")[&EntityKind::Person], 2);
    let m1: Meeting = store.load("m1").expect("m1");
    let m2: Meeting = store.load("m2").expect("m2");
    assert_ne!(m1.host_id, m2.host_id);

    let flags = store.list_person_flags().expect("flags");
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].name, "Jonathon Smith");
    assert_eq!(flags[0].context, "b#m2");

    // Re-ingesting the same record does not duplicate the persisted flag.
    ingestor
        .ingest_json("b", &legacy("m2", &["Jonathon Smith"]))
        .expect("m2 again");
    assert_eq!(store.list_person_flags().expect("flags").len(), 1);
}

#[test]
fn auto_merge_records_the_variant_as_an_alias() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::offline(dir.path());
    settings.people.match_policy = PersonMatchPolicy::AutoMerge;
    let store = EntityStore::open(settings.store_dir()).expect("open");
    let ingestor = Ingestor::new(&store, &settings);

    ingestor
        .ingest_json("a", &legacy("m1", &["Jonathan Smith"]))
        .expect("m1");
    ingestor
        .ingest_json("b", &legacy("m2", &["jonathon smith"]))
        .expect("m2");

    let people: Vec<Person> = store.list().expect("people");
    assert_eq!(people.len(), 1);
    assert_eq!(people[0].aliases, vec!["jonathon smith".to_string()]);

    let by_alias: Vec<Person> = store
        .query(&Filter::NameMatches("Jonathon Smith".to_string()))
        .expect("by alias");
    assert_eq!(by_alias.len(), 1);
    let hosted: Vec<Meeting> = store
        .query(&Filter::ReferencesPerson(people[0].id.clone()))
        .expect("meetings");
    assert_eq!(hosted.len(), 2);
}

#[test]
fn case_and_punctuation_variants_resolve_to_one_person() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let store = EntityStore::open(settings.store_dir()).expect("open");
    let ingestor = Ingestor::new(&store, &settings);

    ingestor
        .ingest_json("a", &legacy("m1", &["Ada Lovelace"]))
        .expect("m1");
    ingestor
        .ingest_json("b", &legacy("m2", &["ADA  LOVELACE."]))
        .expect("m2");
    assert_eq!(store.counts().expect("counts")[&EntityKind::Person], 1);
    assert!(store.list_person_flags().expect("flags").is_empty());
}
