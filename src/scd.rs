use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument, warn};

/// Incoming patient state for one run, keyed by the natural `patient_id`.
///
/// Attributes are optional because sources are ragged; a snapshot whose
/// `patient_id` is empty is malformed and gets rejected, never inserted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientSnapshot {
    pub patient_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub insurance: Option<String>,
}

impl PatientSnapshot {
    /// Field-by-field equality over the tracked attribute set.
    /// None vs None is equal; None vs Some is a change.
    fn tracked_eq(&self, dim: &DimPatient) -> bool {
        self.first_name == dim.first_name
            && self.last_name == dim.last_name
            && self.gender == dim.gender
            && self.date_of_birth == dim.date_of_birth
            && self.insurance == dim.insurance
    }
}

/// One row of the patient dimension.
///
/// `expiry_date = None` and `is_current = true` mark the open version;
/// closed rows are append-only history and never change again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimPatient {
    pub patient_key: u64,
    pub patient_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub insurance: Option<String>,
    pub effective_date: NaiveDate,
    pub expiry_date: Option<NaiveDate>,
    pub is_current: bool,
    pub version: u32,
}

impl DimPatient {
    fn from_snapshot(snapshot: PatientSnapshot, key: u64, version: u32, run_date: NaiveDate) -> Self {
        Self {
            patient_key: key,
            patient_id: snapshot.patient_id,
            first_name: snapshot.first_name,
            last_name: snapshot.last_name,
            gender: snapshot.gender,
            date_of_birth: snapshot.date_of_birth,
            insurance: snapshot.insurance,
            effective_date: run_date,
            expiry_date: None,
            is_current: true,
            version,
        }
    }
}

/// A snapshot excluded from the batch, with its input position and reason.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedSnapshot {
    pub row: usize,
    pub reason: String,
    pub snapshot: PatientSnapshot,
}

/// One planned insert: a brand-new key (`closes = None`) or a Type-2
/// supersession closing the current row with the given surrogate key.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub snapshot: PatientSnapshot,
    pub version: u32,
    pub closes: Option<u64>,
}

/// Full decision set for one run, computed before anything is touched.
#[derive(Debug)]
pub struct ScdPlan {
    pub changes: Vec<PlannedChange>,
    pub unchanged: usize,
    pub rejects: Vec<RejectedSnapshot>,
}

/// Outcome of applying a plan: the complete replacement table plus counts.
#[derive(Debug)]
pub struct ScdOutcome {
    pub table: Vec<DimPatient>,
    pub inserted: usize,
    pub superseded: usize,
    pub unchanged: usize,
    pub rejects: Vec<RejectedSnapshot>,
}

/// Compute the per-key decisions for a batch, without mutating anything.
///
/// Duplicate natural keys within one batch collapse to the last row in
/// input order, so a key decides at most one change per run. Rows already
/// closed in `existing` never participate in matching.
pub fn plan(existing: &[DimPatient], incoming: &[PatientSnapshot]) -> ScdPlan {
    // Index current rows by natural key. If the stored state is corrupt and
    // carries more than one current row per key, the highest version wins.
    let mut current_by_id: HashMap<&str, &DimPatient> = HashMap::new();
    for record in existing.iter().filter(|r| r.is_current) {
        match current_by_id.entry(record.patient_id.as_str()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                warn!(
                    "Duplicate current rows for patient {}; keeping the highest version",
                    record.patient_id
                );
                if record.version > slot.get().version {
                    slot.insert(record);
                }
            }
        }
    }

    // Collapse duplicate incoming keys: last row in input order wins,
    // slotted at the key's first appearance.
    let mut rejects = Vec::new();
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, PatientSnapshot> = HashMap::new();
    for (row, snapshot) in incoming.iter().enumerate() {
        if snapshot.patient_id.trim().is_empty() {
            rejects.push(RejectedSnapshot {
                row,
                reason: "missing patient_id".to_string(),
                snapshot: snapshot.clone(),
            });
            continue;
        }
        if !latest.contains_key(&snapshot.patient_id) {
            order.push(snapshot.patient_id.clone());
        } else {
            debug!(
                "Duplicate patient_id {} in batch; last row wins",
                snapshot.patient_id
            );
        }
        latest.insert(snapshot.patient_id.clone(), snapshot.clone());
    }

    let mut changes = Vec::new();
    let mut unchanged = 0usize;
    for patient_id in order {
        let Some(snapshot) = latest.remove(&patient_id) else {
            continue;
        };
        match current_by_id.get(patient_id.as_str()) {
            None => changes.push(PlannedChange {
                snapshot,
                version: 1,
                closes: None,
            }),
            Some(current) if snapshot.tracked_eq(current) => unchanged += 1,
            Some(current) => changes.push(PlannedChange {
                snapshot,
                version: current.version + 1,
                closes: Some(current.patient_key),
            }),
        }
    }

    ScdPlan {
        changes,
        unchanged,
        rejects,
    }
}

/// Materialize the replacement table from a plan.
///
/// Output order: the whole of `existing` in input order (closed rows and
/// untouched current rows byte-identical; rows named by the plan closed
/// with `expiry_date = run_date`), then the planned inserts in decision
/// order. Surrogate keys continue from the existing maximum and are never
/// reused.
pub fn apply(existing: &[DimPatient], plan: &ScdPlan, run_date: NaiveDate) -> Vec<DimPatient> {
    let closing: HashSet<u64> = plan.changes.iter().filter_map(|c| c.closes).collect();
    let mut next_key = existing.iter().map(|r| r.patient_key).max().unwrap_or(0) + 1;

    let mut table: Vec<DimPatient> = Vec::with_capacity(existing.len() + plan.changes.len());
    for record in existing {
        if record.is_current && closing.contains(&record.patient_key) {
            let mut closed = record.clone();
            closed.expiry_date = Some(run_date);
            closed.is_current = false;
            table.push(closed);
        } else {
            table.push(record.clone());
        }
    }

    for change in &plan.changes {
        table.push(DimPatient::from_snapshot(
            change.snapshot.clone(),
            next_key,
            change.version,
            run_date,
        ));
        next_key += 1;
    }

    table
}

/// Plan and apply one SCD Type 2 run over the full dimension state.
#[instrument(skip(existing, incoming))]
pub fn run(
    existing: &[DimPatient],
    incoming: &[PatientSnapshot],
    run_date: NaiveDate,
) -> ScdOutcome {
    let plan = plan(existing, incoming);
    let inserted = plan.changes.iter().filter(|c| c.closes.is_none()).count();
    let superseded = plan.changes.len() - inserted;

    info!(
        "SCD plan: {} new, {} changed, {} unchanged, {} rejected",
        inserted,
        superseded,
        plan.unchanged,
        plan.rejects.len()
    );

    let table = apply(existing, &plan, run_date);
    ScdOutcome {
        table,
        inserted,
        superseded,
        unchanged: plan.unchanged,
        rejects: plan.rejects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn snapshot(id: &str, insurance: &str) -> PatientSnapshot {
        PatientSnapshot {
            patient_id: id.to_string(),
            first_name: Some("Amy".to_string()),
            last_name: Some("Pond".to_string()),
            gender: Some("F".to_string()),
            date_of_birth: Some(d("1990-01-01")),
            insurance: Some(insurance.to_string()),
        }
    }

    fn current(key: u64, id: &str, insurance: &str, version: u32) -> DimPatient {
        DimPatient {
            patient_key: key,
            patient_id: id.to_string(),
            first_name: Some("Amy".to_string()),
            last_name: Some("Pond".to_string()),
            gender: Some("F".to_string()),
            date_of_birth: Some(d("1990-01-01")),
            insurance: Some(insurance.to_string()),
            effective_date: d("2024-01-01"),
            expiry_date: None,
            is_current: true,
            version,
        }
    }

    #[test]
    fn new_patient_inserts_version_one() {
        let outcome = run(&[], &[snapshot("1", "X")], d("2025-06-01"));
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.table.len(), 1);

        let row = &outcome.table[0];
        assert_eq!(row.patient_key, 1);
        assert_eq!(row.version, 1);
        assert!(row.is_current);
        assert_eq!(row.effective_date, d("2025-06-01"));
        assert_eq!(row.expiry_date, None);
    }

    #[test]
    fn changed_patient_closes_old_and_opens_new_version() {
        let existing = vec![current(1, "1", "X", 1)];
        let outcome = run(&existing, &[snapshot("1", "Y")], d("2025-06-01"));

        assert_eq!(outcome.superseded, 1);
        assert_eq!(outcome.table.len(), 2);

        let closed = &outcome.table[0];
        assert!(!closed.is_current);
        assert_eq!(closed.expiry_date, Some(d("2025-06-01")));
        assert_eq!(closed.insurance.as_deref(), Some("X"));
        assert_eq!(closed.version, 1);

        let open = &outcome.table[1];
        assert!(open.is_current);
        assert_eq!(open.version, 2);
        assert_eq!(open.patient_key, 2);
        assert_eq!(open.insurance.as_deref(), Some("Y"));
        assert!(open.effective_date >= closed.expiry_date.unwrap());
    }

    #[test]
    fn unchanged_patient_leaves_table_identical() {
        let existing = vec![current(1, "1", "X", 1)];
        let outcome = run(&existing, &[snapshot("1", "X")], d("2025-06-01"));

        assert_eq!(outcome.unchanged, 1);
        assert_eq!(outcome.table, existing);
    }

    #[test]
    fn none_vs_none_counts_as_equal() {
        let mut existing_row = current(1, "1", "X", 1);
        existing_row.insurance = None;
        let mut incoming = snapshot("1", "X");
        incoming.insurance = None;

        let outcome = run(&[existing_row.clone()], &[incoming], d("2025-06-01"));
        assert_eq!(outcome.unchanged, 1);
        assert_eq!(outcome.table, vec![existing_row]);
    }

    #[test]
    fn none_vs_value_counts_as_changed() {
        let mut existing_row = current(1, "1", "X", 1);
        existing_row.insurance = None;

        let outcome = run(&[existing_row], &[snapshot("1", "X")], d("2025-06-01"));
        assert_eq!(outcome.superseded, 1);
    }

    #[test]
    fn missing_natural_key_is_rejected_not_fatal() {
        let mut bad = snapshot("", "X");
        bad.patient_id = "  ".to_string();
        let outcome = run(&[], &[bad, snapshot("2", "X")], d("2025-06-01"));

        assert_eq!(outcome.rejects.len(), 1);
        assert_eq!(outcome.rejects[0].row, 0);
        assert_eq!(outcome.rejects[0].reason, "missing patient_id");
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.table.len(), 1);
        assert_eq!(outcome.table[0].patient_id, "2");
    }

    #[test]
    fn duplicate_keys_in_batch_last_row_wins() {
        let outcome = run(
            &[],
            &[snapshot("1", "X"), snapshot("1", "Y")],
            d("2025-06-01"),
        );

        // One insert only, carrying the later row's values.
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.table.len(), 1);
        assert_eq!(outcome.table[0].insurance.as_deref(), Some("Y"));
        assert_eq!(outcome.table[0].version, 1);
    }

    #[test]
    fn duplicate_against_existing_closes_once() {
        let existing = vec![current(1, "1", "X", 1)];
        let outcome = run(
            &existing,
            &[snapshot("1", "Y"), snapshot("1", "Z")],
            d("2025-06-01"),
        );

        assert_eq!(outcome.superseded, 1);
        assert_eq!(outcome.table.len(), 2);
        let open: Vec<_> = outcome.table.iter().filter(|r| r.is_current).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].insurance.as_deref(), Some("Z"));
        assert_eq!(open[0].version, 2);
    }

    #[test]
    fn closed_history_is_carried_through_untouched() {
        let mut closed = current(1, "1", "X", 1);
        closed.is_current = false;
        closed.expiry_date = Some(d("2024-06-01"));
        let existing = vec![closed.clone(), current(2, "1", "Y", 2)];

        let outcome = run(&existing, &[snapshot("1", "Z")], d("2025-06-01"));

        assert_eq!(outcome.table.len(), 3);
        assert_eq!(outcome.table[0], closed);
        assert_eq!(outcome.table[2].version, 3);
        assert_eq!(outcome.table[2].patient_key, 3);
    }

    #[test]
    fn surrogate_keys_continue_from_existing_maximum() {
        let existing = vec![current(7, "1", "X", 1)];
        let outcome = run(
            &existing,
            &[snapshot("1", "Y"), snapshot("9", "X")],
            d("2025-06-01"),
        );

        let keys: Vec<u64> = outcome.table.iter().map(|r| r.patient_key).collect();
        assert_eq!(keys, vec![7, 8, 9]);
    }

    #[test]
    fn rerun_with_same_batch_is_idempotent() {
        let batch = vec![snapshot("1", "X"), snapshot("2", "Y")];
        let first = run(&[], &batch, d("2025-06-01"));
        let second = run(&first.table, &batch, d("2025-06-02"));

        assert_eq!(second.inserted, 0);
        assert_eq!(second.superseded, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.table, first.table);
    }

    #[test]
    fn at_most_one_current_row_per_key_across_runs() {
        let mut table = Vec::new();
        for (run_date, insurance) in [
            ("2025-01-01", "X"),
            ("2025-02-01", "Y"),
            ("2025-03-01", "Y"),
            ("2025-04-01", "Z"),
        ] {
            let outcome = run(&table, &[snapshot("1", insurance)], d(run_date));
            table = outcome.table;
        }

        let current_rows: Vec<_> = table.iter().filter(|r| r.is_current).collect();
        assert_eq!(current_rows.len(), 1);
        assert_eq!(current_rows[0].version, 3);

        let mut versions: Vec<u32> = table.iter().map(|r| r.version).collect();
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2, 3]);
    }
}
