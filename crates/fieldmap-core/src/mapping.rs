//! Folding field-definition pages into persisted mapping state.
//!
//! The state only ever grows: entries are never removed, an entry's `name` and
//! `normalized_name` are fixed when it is created, and option labels already
//! recorded are never overwritten. A field renaming an option upstream while
//! other options change keeps the label seen first, so historical records
//! keep resolving to the label they were written with.
//!
//! `field_type` is the one exception to the fixed-at-creation rule. It is
//! refreshed whenever the stored options are empty or identical to the
//! incoming ones, which lets state written before `field_type` existed pick it
//! up on the next run.

use serde::Serialize;
use tracing::debug;

use crate::{FieldDefinition, MappingEntry, MappingState, NamingConvention, OptionMap};

/// What a merge did, for run summaries and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub created: usize,
    pub refreshed: usize,
    pub extended: usize,
    pub options_added: usize,
    pub skipped: usize,
}

impl MergeReport {
    pub fn absorb(&mut self, other: MergeReport) {
        self.created += other.created;
        self.refreshed += other.refreshed;
        self.extended += other.extended;
        self.options_added += other.options_added;
        self.skipped += other.skipped;
    }

    pub fn touched(&self) -> usize {
        self.created + self.refreshed + self.extended
    }
}

/// Fold one page of definitions into `state`, left to right.
pub fn merge(
    field_defs: &[FieldDefinition],
    state: MappingState,
    naming: &dyn NamingConvention,
) -> MappingState {
    merge_with_report(field_defs, state, naming).0
}

pub fn merge_with_report(
    field_defs: &[FieldDefinition],
    state: MappingState,
    naming: &dyn NamingConvention,
) -> (MappingState, MergeReport) {
    let mut report = MergeReport::default();
    let state = field_defs.iter().fold(state, |state, def| {
        if def.is_mappable() {
            apply_definition(state, def, naming, &mut report)
        } else {
            report.skipped += 1;
            state
        }
    });
    (state, report)
}

/// Fold several pages in order, as fetched.
pub fn merge_pages(
    pages: &[Vec<FieldDefinition>],
    state: MappingState,
    naming: &dyn NamingConvention,
) -> (MappingState, MergeReport) {
    let mut total = MergeReport::default();
    let state = pages.iter().fold(state, |state, page| {
        let (state, report) = merge_with_report(page, state, naming);
        total.absorb(report);
        state
    });
    (state, total)
}

/// Add-only join: every pair of `existing`, plus pairs of `incoming` whose id
/// is not yet known.
pub fn merge_options(existing: &OptionMap, incoming: &OptionMap) -> OptionMap {
    let mut merged = existing.clone();
    for (id, label) in incoming {
        merged.entry(id.clone()).or_insert_with(|| label.clone());
    }
    merged
}

fn apply_definition(
    mut state: MappingState,
    def: &FieldDefinition,
    naming: &dyn NamingConvention,
    report: &mut MergeReport,
) -> MappingState {
    let updated = match state.get(&def.key) {
        None => {
            let entry = MappingEntry::from_definition(def, naming);
            debug!(
                key = %def.key,
                name = %entry.name,
                normalized_name = %entry.normalized_name,
                options = entry.options.len(),
                "created mapping entry"
            );
            report.created += 1;
            entry
        }
        Some(existing) => update_entry(existing, def, report),
    };
    state.insert(def.key.clone(), updated);
    state
}

fn update_entry(
    existing: &MappingEntry,
    def: &FieldDefinition,
    report: &mut MergeReport,
) -> MappingEntry {
    let incoming = def.option_map();

    if existing.options.is_empty() || existing.options == incoming {
        report.refreshed += 1;
        return MappingEntry {
            options: incoming,
            field_type: def.field_type.clone(),
            ..existing.clone()
        };
    }

    let options = merge_options(&existing.options, &incoming);
    let added = options.len() - existing.options.len();
    if added > 0 {
        debug!(key = %def.key, added, "appended new options to mapping entry");
    }
    report.extended += 1;
    report.options_added += added;
    MappingEntry {
        options,
        ..existing.clone()
    }
}
