//! Person identity resolution at ingestion time.
//!
//! Exact matches on the folded name (display name or alias) resolve directly. Anything fuzzier
//! follows `PersonMatchPolicy`; a match that could go more than one way is always flagged and
//! never merged.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{PeopleSettings, PersonMatchPolicy};
use crate::domain::{Person, PersonRole};
use crate::integrity::sha256_hex;
use crate::normalize::names::{name_similarity, normalize_name};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    /// Similar to exactly one existing person, kept separate under `flag_only`.
    NearDuplicate,
    /// Similar to several existing persons.
    MultipleCandidates,
    /// The folded name is already claimed by more than one person.
    AmbiguousExact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonMatchFlag {
    pub name: String,
    pub normalized: String,
    pub reason: FlagReason,
    pub candidates: Vec<String>,
    pub best_similarity: f64,
    /// Person the name ended up attached to, if any.
    pub resolved_to: Option<String>,
    pub context: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Exact,
    Created,
    MergedAlias,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub person_id: Option<String>,
    pub outcome: MatchOutcome,
}

pub fn person_id_for(normalized: &str) -> String {
    let h = sha256_hex(normalized.as_bytes());
    format!("person-{}", &h[..16])
}

#[derive(Debug, Clone)]
pub struct PersonResolver {
    policy: PersonMatchPolicy,
    threshold: f64,
    people: BTreeMap<String, Person>,
    by_name: BTreeMap<String, BTreeSet<String>>,
    touched: BTreeSet<String>,
    flags: Vec<PersonMatchFlag>,
}

impl PersonResolver {
    pub fn new(settings: &PeopleSettings, existing: Vec<Person>) -> Self {
        let mut r = Self {
            policy: settings.match_policy,
            threshold: settings.similarity_threshold,
            people: BTreeMap::new(),
            by_name: BTreeMap::new(),
            touched: BTreeSet::new(),
            flags: Vec::new(),
        };
        for p in existing {
            r.index_person(&p);
            r.people.insert(p.id.clone(), p);
        }
        r
    }

    fn index_person(&mut self, p: &Person) {
        for name in std::iter::once(&p.display_name).chain(p.aliases.iter()) {
            let n = normalize_name(name);
            if n.is_empty() {
                continue;
            }
            self.by_name.entry(n).or_default().insert(p.id.clone());
        }
    }

    /// Resolve `raw_name` to a person id, creating or merging as policy allows.
    /// `context` identifies the record being ingested and ends up on any flag.
    pub fn resolve(&mut self, raw_name: &str, role: PersonRole, context: &str) -> Resolution {
        let display = raw_name.split_whitespace().collect::<Vec<_>>().join(" ");
        let normalized = normalize_name(&display);
        if normalized.is_empty() {
            return Resolution {
                person_id: None,
                outcome: MatchOutcome::Unresolved,
            };
        }

        if let Some(ids) = self.by_name.get(&normalized) {
            if ids.len() == 1 {
                let id = ids.iter().next().cloned();
                return Resolution {
                    person_id: id,
                    outcome: MatchOutcome::Exact,
                };
            }
            let candidates: Vec<String> = ids.iter().cloned().collect();
            self.flag(&display, &normalized, FlagReason::AmbiguousExact, candidates, 1.0, None, context);
            return Resolution {
                person_id: None,
                outcome: MatchOutcome::Unresolved,
            };
        }

        let mut scored: Vec<(String, f64)> = Vec::new();
        for (name, ids) in self.by_name.iter() {
            let s = name_similarity(&normalized, name);
            if s >= self.threshold {
                for id in ids {
                    scored.push((id.clone(), s));
                }
            }
        }
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        let mut candidate_ids: Vec<String> = Vec::new();
        for (id, _) in scored.iter() {
            if !candidate_ids.contains(id) {
                candidate_ids.push(id.clone());
            }
        }
        let best = scored.first().map(|(_, s)| *s).unwrap_or(0.0);

        match (candidate_ids.len(), self.policy) {
            (0, _) => {}
            (1, PersonMatchPolicy::AutoMerge) => {
                let id = candidate_ids[0].clone();
                self.add_alias(&id, &display);
                return Resolution {
                    person_id: Some(id),
                    outcome: MatchOutcome::MergedAlias,
                };
            }
            (1, PersonMatchPolicy::FlagOnly) => {
                let id = self.create(&display, &normalized, role);
                self.flag(
                    &display,
                    &normalized,
                    FlagReason::NearDuplicate,
                    candidate_ids,
                    best,
                    Some(id.clone()),
                    context,
                );
                return Resolution {
                    person_id: Some(id),
                    outcome: MatchOutcome::Created,
                };
            }
            (_, _) => {
                let id = self.create(&display, &normalized, role);
                self.flag(
                    &display,
                    &normalized,
                    FlagReason::MultipleCandidates,
                    candidate_ids,
                    best,
                    Some(id.clone()),
                    context,
                );
                return Resolution {
                    person_id: Some(id),
                    outcome: MatchOutcome::Created,
                };
            }
        }

        let id = self.create(&display, &normalized, role);
        Resolution {
            person_id: Some(id),
            outcome: MatchOutcome::Created,
        }
    }

    fn create(&mut self, display: &str, normalized: &str, role: PersonRole) -> String {
        let id = person_id_for(normalized);
        let person = Person {
            id: id.clone(),
            display_name: display.to_string(),
            aliases: Vec::new(),
            role,
        };
        self.index_person(&person);
        self.people.insert(id.clone(), person);
        self.touched.insert(id.clone());
        id
    }

    fn add_alias(&mut self, id: &str, alias: &str) {
        let Some(p) = self.people.get_mut(id) else {
            return;
        };
        if !p.aliases.iter().any(|a| a == alias) && p.display_name != alias {
            p.aliases.push(alias.to_string());
            p.aliases.sort();
        }
        let n = normalize_name(alias);
        self.by_name.entry(n).or_default().insert(id.to_string());
        self.touched.insert(id.to_string());
    }

    #[allow(clippy::too_many_arguments)]
    fn flag(
        &mut self,
        name: &str,
        normalized: &str,
        reason: FlagReason,
        candidates: Vec<String>,
        best_similarity: f64,
        resolved_to: Option<String>,
        context: &str,
    ) {
        warn!(
            person = name,
            ?reason,
            candidates = candidates.len(),
            context,
            "person match flagged for review"
        );
        self.flags.push(PersonMatchFlag {
            name: name.to_string(),
            normalized: normalized.to_string(),
            reason,
            candidates,
            best_similarity,
            resolved_to,
            context: context.to_string(),
        });
    }

    /// Persons created or changed since construction, in id order.
    pub fn touched(&self) -> Vec<Person> {
        self.touched
            .iter()
            .filter_map(|id| self.people.get(id).cloned())
            .collect()
    }

    pub fn flags(&self) -> &[PersonMatchFlag] {
        &self.flags
    }

    pub fn get(&self, id: &str) -> Option<&Person> {
        self.people.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(policy: PersonMatchPolicy) -> PeopleSettings {
        PeopleSettings {
            match_policy: policy,
            similarity_threshold: 0.85,
        }
    }

    fn existing(name: &str) -> Person {
        Person {
            id: person_id_for(&normalize_name(name)),
            display_name: name.to_string(),
            aliases: vec![],
            role: PersonRole::Participant,
        }
    }

    #[test]
    fn exact_match_is_case_and_punctuation_insensitive() {
        let mut r = PersonResolver::new(&settings(PersonMatchPolicy::FlagOnly), vec![existing("Ada Lovelace")]);
        let res = r.resolve("  ada   LOVELACE.", PersonRole::Host, "m1");
        assert_eq!(res.outcome, MatchOutcome::Exact);
        assert_eq!(res.person_id, Some(existing("Ada Lovelace").id));
        assert!(r.touched().is_empty());
        assert!(r.flags().is_empty());
    }

    #[test]
    fn flag_only_keeps_near_duplicates_separate() {
        let mut r = PersonResolver::new(
            &settings(PersonMatchPolicy::FlagOnly),
            vec![existing("Jonathan Smith")],
        );
        let res = r.resolve("Jonathon Smith", PersonRole::Participant, "m2");
        assert_eq!(res.outcome, MatchOutcome::Created);
        assert_ne!(res.person_id, Some(existing("Jonathan Smith").id));
        assert_eq!(r.flags().len(), 1);
        assert_eq!(r.flags()[0].reason, FlagReason::NearDuplicate);
    }

    #[test]
    fn auto_merge_adds_alias_for_single_candidate() {
        let mut r = PersonResolver::new(
            &settings(PersonMatchPolicy::AutoMerge),
            vec![existing("Jonathan Smith")],
        );
        let res = r.resolve("Jonathon Smith", PersonRole::Participant, "m2");
        assert_eq!(res.outcome, MatchOutcome::MergedAlias);
        let touched = r.touched();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].aliases, vec!["Jonathon Smith".to_string()]);
        // The alias now resolves exactly.
        let again = r.resolve("jonathon smith", PersonRole::Participant, "m3");
        assert_eq!(again.outcome, MatchOutcome::Exact);
    }

    #[test]
    fn auto_merge_never_merges_multiple_candidates() {
        let mut r = PersonResolver::new(
            &settings(PersonMatchPolicy::AutoMerge),
            vec![existing("Maria Lopez"), existing("Mario Lopez")],
        );
        let res = r.resolve("Marie Lopez", PersonRole::Participant, "m4");
        assert_eq!(res.outcome, MatchOutcome::Created);
        assert_eq!(r.flags()[0].reason, FlagReason::MultipleCandidates);
        assert_eq!(r.flags()[0].candidates.len(), 2);
    }
}
