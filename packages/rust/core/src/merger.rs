//! Non-destructive record merging.

use chrono::Utc;
use leadscout_shared::{
    AI_RESEARCH_SOURCE, CandidateRecord, Locality, PersistedRecord, Temperature, is_blank,
};
use uuid::Uuid;

/// Separator placed between existing notes and appended candidate notes.
const NOTES_SEPARATOR: &str = "\n\n";

/// Result of merging a candidate into an existing record.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: PersistedRecord,
    /// Names of the fields that changed. Informational only.
    pub fields_changed: Vec<&'static str>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !self.fields_changed.is_empty()
    }
}

/// Merges candidates into persisted records and builds new ones.
pub trait RecordMerger: Send + Sync {
    /// Fill blanks of `existing` from `candidate`. Never overwrites a
    /// non-blank value and never removes a tag.
    fn merge(&self, existing: &PersistedRecord, candidate: &CandidateRecord) -> MergeOutcome;

    /// Build a brand-new record for `locality`.
    fn create(&self, candidate: &CandidateRecord, locality: &Locality) -> PersistedRecord;
}

/// Fill-in-blanks merger with additive tags and appended notes.
#[derive(Debug, Default, Clone, Copy)]
pub struct FillBlanksMerger;

impl RecordMerger for FillBlanksMerger {
    fn merge(&self, existing: &PersistedRecord, candidate: &CandidateRecord) -> MergeOutcome {
        let mut record = existing.clone();
        let mut changed = Vec::new();

        if record.name.trim().is_empty() && !candidate.name.trim().is_empty() {
            record.name = candidate.name.trim().to_string();
            changed.push("name");
        }

        fill(&mut record.company, &candidate.company, "company", &mut changed);
        fill(&mut record.record_type, &candidate.record_type, "record_type", &mut changed);
        fill(&mut record.email, &candidate.email, "email", &mut changed);
        fill(&mut record.phone, &candidate.phone, "phone", &mut changed);
        fill(&mut record.instagram, &candidate.instagram, "instagram", &mut changed);
        fill(&mut record.telegram, &candidate.telegram, "telegram", &mut changed);
        fill(&mut record.website, &candidate.website, "website", &mut changed);

        if record.temperature.is_none() && candidate.temperature.is_some() {
            record.temperature = candidate.temperature;
            changed.push("temperature");
        }

        if let Some(notes) = merge_notes(record.notes.as_deref(), candidate.notes.as_deref()) {
            record.notes = Some(notes);
            changed.push("notes");
        }

        let before = record.tags.len();
        record.tags = union_tags(&record.tags, &candidate.tags);
        if record.tags.len() != before {
            changed.push("tags");
        }

        if !changed.is_empty() {
            record.updated_at = Utc::now();
        }

        MergeOutcome {
            record,
            fields_changed: changed,
        }
    }

    fn create(&self, candidate: &CandidateRecord, locality: &Locality) -> PersistedRecord {
        let clean = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let now = Utc::now();

        PersistedRecord {
            id: Uuid::now_v7().to_string(),
            locality_id: Some(locality.id.clone()),
            name: candidate.name.trim().to_string(),
            company: clean(&candidate.company),
            record_type: clean(&candidate.record_type),
            email: clean(&candidate.email),
            phone: clean(&candidate.phone),
            instagram: clean(&candidate.instagram),
            telegram: clean(&candidate.telegram),
            website: clean(&candidate.website),
            notes: clean(&candidate.notes),
            temperature: Some(candidate.temperature.unwrap_or(Temperature::Cold)),
            source: AI_RESEARCH_SOURCE.to_string(),
            tags: union_tags(&[], &candidate.tags),
            created_at: now,
            updated_at: now,
        }
    }
}

fn fill(
    slot: &mut Option<String>,
    value: &Option<String>,
    field: &'static str,
    changed: &mut Vec<&'static str>,
) {
    if !is_blank(slot.as_deref()) || is_blank(value.as_deref()) {
        return;
    }
    *slot = value.as_deref().map(|v| v.trim().to_string());
    changed.push(field);
}

/// New notes text, or `None` when nothing changes. Candidate notes already
/// contained in the existing text are not appended again.
fn merge_notes(existing: Option<&str>, incoming: Option<&str>) -> Option<String> {
    let incoming = incoming.map(str::trim).filter(|s| !s.is_empty())?;
    match existing.map(str::trim).filter(|s| !s.is_empty()) {
        None => Some(incoming.to_string()),
        Some(current) if current.contains(incoming) => None,
        Some(_) => Some(format!(
            "{}{NOTES_SEPARATOR}{incoming}",
            existing.unwrap_or_default().trim_end()
        )),
    }
}

/// Case-insensitive tag union keeping the first-seen spelling.
pub fn union_tags(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    for tag in existing.iter().chain(incoming) {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        let key = tag.to_lowercase();
        if !out.iter().any(|t| t.to_lowercase() == key) {
            out.push(tag.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn berlin() -> Locality {
        Locality {
            id: "loc-berlin".into(),
            name: "Berlin".into(),
            country: "Germany".into(),
            iso2: "DE".into(),
        }
    }

    fn existing() -> PersistedRecord {
        PersistedRecord {
            email: Some("a@x.com".into()),
            notes: Some("met at festival".into()),
            tags: vec!["Techno".into()],
            source: "manual".into(),
            ..PersistedRecord::blank(Some("loc-berlin".into()))
        }
    }

    fn candidate() -> CandidateRecord {
        CandidateRecord {
            name: "Foo".into(),
            email: Some("other@x.com".into()),
            phone: Some("+49301234567".into()),
            notes: Some("runs monthly parties".into()),
            temperature: Some(Temperature::Hot),
            tags: vec!["techno".into(), "Queer".into()],
            ..Default::default()
        }
    }

    #[test]
    fn fills_blanks_and_keeps_existing_values() {
        let outcome = FillBlanksMerger.merge(&existing(), &candidate());
        let merged = outcome.record;

        assert_eq!(merged.name, "Foo");
        assert_eq!(merged.email.as_deref(), Some("a@x.com"));
        assert_eq!(merged.phone.as_deref(), Some("+49301234567"));
        assert_eq!(merged.temperature, Some(Temperature::Hot));
        assert_eq!(merged.source, "manual");
        assert_eq!(
            merged.notes.as_deref(),
            Some("met at festival\n\nruns monthly parties")
        );
        assert_eq!(merged.tags, vec!["Techno".to_string(), "Queer".to_string()]);
        assert!(outcome.fields_changed.contains(&"name"));
        assert!(!outcome.fields_changed.contains(&"email"));
    }

    #[test]
    fn merge_is_idempotent() {
        let once = FillBlanksMerger.merge(&existing(), &candidate());
        let twice = FillBlanksMerger.merge(&once.record, &candidate());
        assert!(!twice.changed(), "second merge changed {:?}", twice.fields_changed);
        assert_eq!(twice.record, once.record);
    }

    #[test]
    fn merge_never_loses_information() {
        let mut base = existing();
        base.name = "Original".into();
        base.temperature = Some(Temperature::Cold);
        base.website = Some("foo.de".into());
        let merged = FillBlanksMerger.merge(&base, &candidate()).record;

        assert_eq!(merged.name, "Original");
        assert_eq!(merged.temperature, Some(Temperature::Cold));
        assert_eq!(merged.website.as_deref(), Some("foo.de"));
        assert!(merged.notes.as_deref().unwrap().starts_with("met at festival"));
        for tag in &base.tags {
            assert!(merged.tags.contains(tag));
        }
    }

    #[test]
    fn blank_candidate_values_do_not_fill() {
        let mut base = existing();
        base.phone = None;
        let blank = CandidateRecord {
            name: "Foo".into(),
            phone: Some("   ".into()),
            ..Default::default()
        };
        let merged = FillBlanksMerger.merge(&base, &blank).record;
        assert_eq!(merged.phone, None);
    }

    #[test]
    fn notes_adopted_when_existing_blank() {
        let mut base = existing();
        base.notes = Some("  ".into());
        let merged = FillBlanksMerger.merge(&base, &candidate()).record;
        assert_eq!(merged.notes.as_deref(), Some("runs monthly parties"));
    }

    #[test]
    fn tag_union_is_commutative_as_a_set() {
        let a = vec!["Techno".to_string(), "House".to_string()];
        let b = vec!["house".to_string(), "Queer".to_string()];
        let lower = |tags: Vec<String>| -> BTreeSet<String> {
            tags.into_iter().map(|t| t.to_lowercase()).collect()
        };
        assert_eq!(lower(union_tags(&a, &b)), lower(union_tags(&b, &a)));
        assert_eq!(union_tags(&a, &b).len(), 3);
    }

    #[test]
    fn create_sets_provenance_and_defaults() {
        let mut c = candidate();
        c.temperature = None;
        c.tags = vec!["Party".into(), "party".into(), " ".into()];
        c.company = Some("  ".into());
        let record = FillBlanksMerger.create(&c, &berlin());

        assert_eq!(record.source, AI_RESEARCH_SOURCE);
        assert_eq!(record.locality_id.as_deref(), Some("loc-berlin"));
        assert_eq!(record.temperature, Some(Temperature::Cold));
        assert_eq!(record.tags, vec!["Party".to_string()]);
        assert_eq!(record.company, None);
        assert_eq!(record.email.as_deref(), Some("other@x.com"));
    }
}
