//! Core domain model and change-provenance types for feedrec.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "feedrec-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Date,
    Number,
    Integer,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Text => "text",
            ColumnKind::Date => "date",
            ColumnKind::Number => "number",
            ColumnKind::Integer => "integer",
        };
        f.write_str(name)
    }
}

/// Typed attribute value. Equality is type-aware: dates compare as dates,
/// numbers compare exactly, text compares byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Null,
    Text(String),
    Date(NaiveDate),
    Number(f64),
    Integer(i64),
}

impl AttrValue {
    /// `None` for `Null`, which is compatible with every column kind.
    pub fn kind(&self) -> Option<ColumnKind> {
        match self {
            AttrValue::Null => None,
            AttrValue::Text(_) => Some(ColumnKind::Text),
            AttrValue::Date(_) => Some(ColumnKind::Date),
            AttrValue::Number(_) => Some(ColumnKind::Number),
            AttrValue::Integer(_) => Some(ColumnKind::Integer),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => f.write_str("NULL"),
            AttrValue::Text(v) => write!(f, "{v:?}"),
            AttrValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            AttrValue::Number(v) => write!(f, "{v}"),
            AttrValue::Integer(v) => write!(f, "{v}"),
        }
    }
}

/// Insertion-ordered attribute mapping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attributes(Vec<(String, AttrValue)>);

impl Attributes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Replaces an existing value in place, otherwise appends.
    pub fn set(&mut self, name: impl Into<String>, value: AttrValue) {
        let name = name.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, AttrValue)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, AttrValue)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.set(k, v);
        }
        attrs
    }
}

/// One tracked feed column: attribute name, CSV header and value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub header: &'static str,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub const fn new(name: &'static str, header: &'static str, kind: ColumnKind) -> Self {
        Self { name, header, kind }
    }
}

/// Fixed column set of one feed type. `identity` is always text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSchema {
    pub identity: ColumnSpec,
    pub columns: &'static [ColumnSpec],
}

impl FeedSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

/// Freshly parsed feed row, not yet compared against stored state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub identity: String,
    pub attributes: Attributes,
    /// 1-based CSV line the row started on, when known.
    pub source_line: Option<u64>,
}

/// Persisted row plus its change-provenance columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub identity: String,
    pub attributes: Attributes,
    pub last_polled: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Attribute names changed by the most recent update; empty for a fresh insert.
    pub last_changed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Insert,
    Update,
    Unchanged,
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconcileOutcome::Insert => "insert",
            ReconcileOutcome::Update => "update",
            ReconcileOutcome::Unchanged => "unchanged",
        };
        f.write_str(name)
    }
}

/// What the persistence gateway should write for one identity.
///
/// `entity` is the full post-reconciliation row, used for the insert half of the
/// upsert. On identity conflict only the columns implied by `outcome` are
/// overwritten: `changed_columns` plus all three provenance columns for an
/// update, `last_polled` alone otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertInstruction {
    pub outcome: ReconcileOutcome,
    pub entity: StoredEntity,
    pub changed_columns: Vec<String>,
}

impl UpsertInstruction {
    pub fn identity(&self) -> &str {
        &self.entity.identity
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReconcileError {
    #[error("candidate {candidate:?} reconciled against stored row {stored:?}")]
    IdentityMismatch { candidate: String, stored: String },
    #[error("{identity}: candidate is missing tracked attribute {column}")]
    MissingAttribute { identity: String, column: &'static str },
    #[error("{identity}: attribute {column} expected {expected}, found {found}")]
    KindMismatch {
        identity: String,
        column: &'static str,
        expected: ColumnKind,
        found: ColumnKind,
    },
}

/// Differential upsert planner for one feed schema.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    schema: FeedSchema,
}

impl Reconciler {
    pub fn new(schema: FeedSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &FeedSchema {
        &self.schema
    }

    pub fn reconcile(
        &self,
        candidate: &CandidateEntity,
        stored: Option<&StoredEntity>,
        now: DateTime<Utc>,
    ) -> Result<UpsertInstruction, ReconcileError> {
        let tracked = self.tracked_attributes(candidate)?;

        let Some(stored) = stored else {
            return Ok(UpsertInstruction {
                outcome: ReconcileOutcome::Insert,
                entity: StoredEntity {
                    identity: candidate.identity.clone(),
                    attributes: tracked,
                    last_polled: Some(now),
                    last_updated: Some(now),
                    last_changed: Vec::new(),
                },
                changed_columns: Vec::new(),
            });
        };

        if stored.identity != candidate.identity {
            return Err(ReconcileError::IdentityMismatch {
                candidate: candidate.identity.clone(),
                stored: stored.identity.clone(),
            });
        }

        let changed = self.changed_columns(&tracked, stored)?;
        // last_polled never moves backwards, even across clock adjustments.
        let polled_at = stored.last_polled.map_or(now, |prev| prev.max(now));

        let mut entity = stored.clone();
        entity.last_polled = Some(polled_at);

        if changed.is_empty() {
            return Ok(UpsertInstruction {
                outcome: ReconcileOutcome::Unchanged,
                entity,
                changed_columns: Vec::new(),
            });
        }

        for name in &changed {
            let value = tracked.get(name).cloned().unwrap_or(AttrValue::Null);
            entity.attributes.set(name.clone(), value);
        }
        entity.last_updated = Some(polled_at);
        entity.last_changed = changed.clone();

        Ok(UpsertInstruction {
            outcome: ReconcileOutcome::Update,
            entity,
            changed_columns: changed,
        })
    }

    /// Names of schema columns whose candidate value differs from the stored
    /// one, in schema order. A column absent from the stored row counts as `Null`.
    pub fn changed_columns(
        &self,
        tracked: &Attributes,
        stored: &StoredEntity,
    ) -> Result<Vec<String>, ReconcileError> {
        let mut changed = Vec::new();
        for column in self.schema.columns {
            let new_value = tracked.get(column.name).unwrap_or(&AttrValue::Null);
            let old_value = stored.attributes.get(column.name).unwrap_or(&AttrValue::Null);
            check_kind(&stored.identity, column, old_value)?;
            if new_value != old_value {
                changed.push(column.name.to_string());
            }
        }
        Ok(changed)
    }

    /// Candidate attributes restricted to the schema, in schema order.
    fn tracked_attributes(&self, candidate: &CandidateEntity) -> Result<Attributes, ReconcileError> {
        let mut tracked = Attributes::new();
        for column in self.schema.columns {
            let value = candidate.attributes.get(column.name).ok_or_else(|| {
                ReconcileError::MissingAttribute {
                    identity: candidate.identity.clone(),
                    column: column.name,
                }
            })?;
            check_kind(&candidate.identity, column, value)?;
            tracked.set(column.name, value.clone());
        }
        Ok(tracked)
    }
}

fn check_kind(identity: &str, column: &ColumnSpec, value: &AttrValue) -> Result<(), ReconcileError> {
    match value.kind() {
        Some(found) if found != column.kind => Err(ReconcileError::KindMismatch {
            identity: identity.to_string(),
            column: column.name,
            expected: column.kind,
            found,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollapsedDuplicate {
    pub identity: String,
    pub superseded_line: Option<u64>,
    pub kept_line: Option<u64>,
}

/// Collapses repeated identities within one feed snapshot. The last occurrence
/// in file order wins, and survivors keep the relative order of their last occurrence.
pub fn dedupe_last_wins(
    candidates: Vec<CandidateEntity>,
) -> (Vec<CandidateEntity>, Vec<CollapsedDuplicate>) {
    let mut last_index: HashMap<&str, usize> = HashMap::with_capacity(candidates.len());
    for (idx, candidate) in candidates.iter().enumerate() {
        last_index.insert(candidate.identity.as_str(), idx);
    }

    let mut collapsed = Vec::new();
    let mut keep = vec![false; candidates.len()];
    for (idx, candidate) in candidates.iter().enumerate() {
        let winner = last_index[candidate.identity.as_str()];
        if winner == idx {
            keep[idx] = true;
        } else {
            collapsed.push(CollapsedDuplicate {
                identity: candidate.identity.clone(),
                superseded_line: candidate.source_line,
                kept_line: candidates[winner].source_line,
            });
        }
    }

    let kept = candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(candidate, keep)| keep.then_some(candidate))
        .collect();
    (kept, collapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    const COLUMNS: &[ColumnSpec] = &[
        ColumnSpec::new("name", "name", ColumnKind::Text),
        ColumnSpec::new("report_date", "reportDate", ColumnKind::Date),
        ColumnSpec::new("fiscal_date_ending", "fiscalDateEnding", ColumnKind::Date),
        ColumnSpec::new("estimate", "estimate", ColumnKind::Number),
        ColumnSpec::new("currency", "currency", ColumnKind::Text),
    ];

    const SCHEMA: FeedSchema = FeedSchema {
        identity: ColumnSpec::new("symbol", "symbol", ColumnKind::Text),
        columns: COLUMNS,
    };

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, hour, 0, 0).single().unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> AttrValue {
        AttrValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    fn candidate(identity: &str, estimate: f64, report_date: AttrValue) -> CandidateEntity {
        CandidateEntity {
            identity: identity.to_string(),
            attributes: [
                ("name", AttrValue::Text("Abc Corp".into())),
                ("report_date", report_date),
                ("fiscal_date_ending", date(2023, 12, 31)),
                ("estimate", AttrValue::Number(estimate)),
                ("currency", AttrValue::Text("USD".into())),
            ]
            .into_iter()
            .collect(),
            source_line: None,
        }
    }

    fn stored_from(candidate: &CandidateEntity, at: DateTime<Utc>) -> StoredEntity {
        Reconciler::new(SCHEMA)
            .reconcile(candidate, None, at)
            .unwrap()
            .entity
    }

    #[test]
    fn changed_estimate_is_the_only_changed_column() {
        let reconciler = Reconciler::new(SCHEMA);
        let stored = stored_from(&candidate("ABC", 1.20, date(2024, 1, 10)), ts(1));
        let plan = reconciler
            .reconcile(&candidate("ABC", 1.25, date(2024, 1, 10)), Some(&stored), ts(2))
            .unwrap();

        assert_eq!(plan.outcome, ReconcileOutcome::Update);
        assert_eq!(plan.changed_columns, vec!["estimate".to_string()]);
        assert_eq!(plan.entity.attributes.get("estimate"), Some(&AttrValue::Number(1.25)));
        assert_eq!(plan.entity.attributes.get("report_date"), Some(&date(2024, 1, 10)));
        assert_eq!(plan.entity.last_updated, Some(ts(2)));
        assert_eq!(plan.entity.last_polled, Some(ts(2)));
        assert_eq!(plan.entity.last_changed, vec!["estimate".to_string()]);
    }

    #[test]
    fn unseen_identity_inserts_without_reporting_changes() {
        let plan = Reconciler::new(SCHEMA)
            .reconcile(&candidate("XYZ", 2.00, AttrValue::Null), None, ts(3))
            .unwrap();

        assert_eq!(plan.outcome, ReconcileOutcome::Insert);
        assert!(plan.changed_columns.is_empty());
        assert!(plan.entity.last_changed.is_empty());
        assert_eq!(plan.entity.last_polled, Some(ts(3)));
        assert_eq!(plan.entity.last_updated, Some(ts(3)));
        assert_eq!(plan.entity.attributes.get("estimate"), Some(&AttrValue::Number(2.0)));
    }

    #[test]
    fn identical_candidate_only_advances_last_polled() {
        let reconciler = Reconciler::new(SCHEMA);
        let row = candidate("ABC", 1.20, date(2024, 1, 10));
        let first = reconciler.reconcile(&row, None, ts(1)).unwrap().entity;
        let second = reconciler.reconcile(&row, Some(&first), ts(2)).unwrap();
        let third = reconciler.reconcile(&row, Some(&second.entity), ts(3)).unwrap();

        for plan in [&second, &third] {
            assert_eq!(plan.outcome, ReconcileOutcome::Unchanged);
            assert!(plan.changed_columns.is_empty());
            assert_eq!(plan.entity.attributes, first.attributes);
            assert_eq!(plan.entity.last_updated, first.last_updated);
            assert_eq!(plan.entity.last_changed, first.last_changed);
        }
        assert_eq!(third.entity.last_polled, Some(ts(3)));
    }

    #[test]
    fn last_changed_survives_a_following_noop_run() {
        let reconciler = Reconciler::new(SCHEMA);
        let stored = stored_from(&candidate("ABC", 1.20, date(2024, 1, 10)), ts(1));
        let changed_row = candidate("ABC", 1.30, date(2024, 1, 11));
        let update = reconciler.reconcile(&changed_row, Some(&stored), ts(2)).unwrap();
        let noop = reconciler
            .reconcile(&changed_row, Some(&update.entity), ts(3))
            .unwrap();

        assert_eq!(noop.entity.last_changed, vec!["report_date", "estimate"]);
        assert_eq!(noop.entity.last_updated, Some(ts(2)));
        assert_eq!(noop.entity.last_polled, Some(ts(3)));
    }

    #[test]
    fn last_polled_does_not_move_backwards() {
        let reconciler = Reconciler::new(SCHEMA);
        let row = candidate("ABC", 1.20, date(2024, 1, 10));
        let stored = stored_from(&row, ts(5));
        let plan = reconciler.reconcile(&row, Some(&stored), ts(4)).unwrap();
        assert_eq!(plan.entity.last_polled, Some(ts(5)));
    }

    #[test]
    fn unchanged_numbers_keep_their_stored_bits() {
        let reconciler = Reconciler::new(SCHEMA);
        let mut stored = stored_from(&candidate("ABC", 1.20, date(2024, 1, 10)), ts(1));
        stored.attributes.set("estimate", AttrValue::Number(-0.0));
        let mut row = candidate("ABC", 0.0, date(2024, 1, 11));
        row.attributes.set("estimate", AttrValue::Number(0.0));

        let plan = reconciler.reconcile(&row, Some(&stored), ts(2)).unwrap();
        assert_eq!(plan.changed_columns, vec!["report_date"]);
        match plan.entity.attributes.get("estimate") {
            Some(AttrValue::Number(v)) => assert_eq!(v.to_bits(), (-0.0f64).to_bits()),
            other => panic!("unexpected estimate {other:?}"),
        }
    }

    #[test]
    fn null_to_value_and_back_are_changes() {
        let reconciler = Reconciler::new(SCHEMA);
        let stored = stored_from(&candidate("ABC", 1.20, AttrValue::Null), ts(1));
        let filled = reconciler
            .reconcile(&candidate("ABC", 1.20, date(2024, 2, 1)), Some(&stored), ts(2))
            .unwrap();
        assert_eq!(filled.changed_columns, vec!["report_date"]);

        let cleared = reconciler
            .reconcile(&candidate("ABC", 1.20, AttrValue::Null), Some(&filled.entity), ts(3))
            .unwrap();
        assert_eq!(cleared.changed_columns, vec!["report_date"]);
        assert_eq!(cleared.entity.attributes.get("report_date"), Some(&AttrValue::Null));
    }

    #[test]
    fn stored_row_missing_a_column_treats_it_as_null() {
        let reconciler = Reconciler::new(SCHEMA);
        let mut stored = stored_from(&candidate("ABC", 1.20, date(2024, 1, 10)), ts(1));
        stored.attributes = stored
            .attributes
            .iter()
            .filter(|(k, _)| *k != "currency")
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();

        let plan = reconciler
            .reconcile(&candidate("ABC", 1.20, date(2024, 1, 10)), Some(&stored), ts(2))
            .unwrap();
        assert_eq!(plan.changed_columns, vec!["currency"]);
        assert_eq!(plan.entity.attributes.get("currency"), Some(&AttrValue::Text("USD".into())));
    }

    #[test]
    fn mistyped_or_missing_candidate_attributes_are_errors() {
        let reconciler = Reconciler::new(SCHEMA);
        let mut row = candidate("ABC", 1.20, date(2024, 1, 10));
        row.attributes.set("estimate", AttrValue::Text("1.20".into()));
        assert_eq!(
            reconciler.reconcile(&row, None, ts(1)),
            Err(ReconcileError::KindMismatch {
                identity: "ABC".into(),
                column: "estimate",
                expected: ColumnKind::Number,
                found: ColumnKind::Text,
            })
        );

        let bare = CandidateEntity {
            identity: "ABC".into(),
            attributes: Attributes::new(),
            source_line: Some(2),
        };
        assert!(matches!(
            reconciler.reconcile(&bare, None, ts(1)),
            Err(ReconcileError::MissingAttribute { column: "name", .. })
        ));
    }

    #[test]
    fn mismatched_identity_is_rejected() {
        let reconciler = Reconciler::new(SCHEMA);
        let stored = stored_from(&candidate("ABC", 1.20, date(2024, 1, 10)), ts(1));
        let err = reconciler
            .reconcile(&candidate("ABD", 1.20, date(2024, 1, 10)), Some(&stored), ts(2))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::IdentityMismatch { .. }));
    }

    #[test]
    fn duplicate_identities_keep_last_occurrence() {
        let mut rows = vec![
            candidate("AAA", 1.0, AttrValue::Null),
            candidate("BBB", 2.0, AttrValue::Null),
            candidate("AAA", 3.0, AttrValue::Null),
            candidate("CCC", 4.0, AttrValue::Null),
        ];
        for (i, row) in rows.iter_mut().enumerate() {
            row.source_line = Some(i as u64 + 2);
        }

        let (kept, collapsed) = dedupe_last_wins(rows);
        let order: Vec<_> = kept.iter().map(|c| c.identity.as_str()).collect();
        assert_eq!(order, vec!["BBB", "AAA", "CCC"]);
        assert_eq!(kept[1].attributes.get("estimate"), Some(&AttrValue::Number(3.0)));
        assert_eq!(
            collapsed,
            vec![CollapsedDuplicate {
                identity: "AAA".into(),
                superseded_line: Some(2),
                kept_line: Some(4),
            }]
        );
    }

    fn base_value(column: &ColumnSpec) -> AttrValue {
        match column.kind {
            ColumnKind::Text => AttrValue::Text(format!("{}-old", column.name)),
            ColumnKind::Date => date(2024, 1, 10),
            ColumnKind::Number => AttrValue::Number(1.5),
            ColumnKind::Integer => AttrValue::Integer(7),
        }
    }

    fn other_value(column: &ColumnSpec) -> AttrValue {
        match column.kind {
            ColumnKind::Text => AttrValue::Text(format!("{}-new", column.name)),
            ColumnKind::Date => date(2024, 1, 11),
            ColumnKind::Number => AttrValue::Number(1.5000000000000002),
            ColumnKind::Integer => AttrValue::Integer(8),
        }
    }

    proptest! {
        #[test]
        fn changed_columns_equal_exactly_the_differing_subset(
            mask in 0u32..(1 << COLUMNS.len()),
            null_mask in 0u32..(1 << COLUMNS.len()),
        ) {
            let reconciler = Reconciler::new(SCHEMA);
            let stored_row = CandidateEntity {
                identity: "ABC".into(),
                attributes: COLUMNS.iter().map(|c| (c.name, base_value(c))).collect(),
                source_line: None,
            };
            let stored = stored_from(&stored_row, ts(1));

            let mut expected = Vec::new();
            let mut attributes = Attributes::new();
            for (i, column) in COLUMNS.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    expected.push(column.name.to_string());
                    let value = if null_mask & (1 << i) != 0 { AttrValue::Null } else { other_value(column) };
                    attributes.set(column.name, value);
                } else {
                    attributes.set(column.name, base_value(column));
                }
            }
            let row = CandidateEntity { identity: "ABC".into(), attributes, source_line: None };

            let plan = reconciler.reconcile(&row, Some(&stored), ts(2)).unwrap();
            prop_assert_eq!(&plan.changed_columns, &expected);
            for column in COLUMNS {
                if !expected.iter().any(|name| name == column.name) {
                    prop_assert_eq!(plan.entity.attributes.get(column.name), stored.attributes.get(column.name));
                }
            }
            if expected.is_empty() {
                prop_assert_eq!(plan.outcome, ReconcileOutcome::Unchanged);
                prop_assert_eq!(plan.entity.last_updated, Some(ts(1)));
            } else {
                prop_assert_eq!(plan.outcome, ReconcileOutcome::Update);
                prop_assert_eq!(plan.entity.last_updated, Some(ts(2)));
                prop_assert_eq!(&plan.entity.last_changed, &expected);
            }
        }
    }
}
