use std::collections::BTreeMap;

use rusqlite::Connection;

use crate::answers::{self, AnswerRow, RowStatus};
use crate::errors::CoreError;

pub const AGE_BANDS: [&str; 4] = ["infant", "toddler", "preschool", "mixed"];

/// Band used when a band-specific instrument is missing. `mixed` rooms get
/// the preschool instrument.
pub fn fallback_band(band: &str) -> Option<&'static str> {
    match band {
        "mixed" => Some("preschool"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Child {
    pub id: String,
    pub classroom_id: String,
    pub last_name: String,
    pub first_name: String,
    pub display_code: Option<String>,
    pub birth_date: Option<String>,
    pub age_band: String,
    pub active: bool,
}

impl Child {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

pub fn load_children(
    conn: &Connection,
    classroom_id: &str,
    include_inactive: bool,
) -> Result<Vec<Child>, CoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, classroom_id, last_name, first_name, display_code,
                    birth_date, age_band, active
             FROM children
             WHERE classroom_id = ? AND (? OR active = 1)
             ORDER BY sort_order, last_name, first_name",
        )
        .map_err(CoreError::db)?;
    stmt.query_map((classroom_id, include_inactive), |r| {
        Ok(Child {
            id: r.get(0)?,
            classroom_id: r.get(1)?,
            last_name: r.get(2)?,
            first_name: r.get(3)?,
            display_code: r.get(4)?,
            birth_date: r.get(5)?,
            age_band: r.get(6)?,
            active: r.get::<_, i64>(7)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CoreError::db)
}

pub fn load_child(conn: &Connection, child_id: &str) -> Result<Option<Child>, CoreError> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        "SELECT id, classroom_id, last_name, first_name, display_code,
                birth_date, age_band, active
         FROM children WHERE id = ?",
        [child_id],
        |r| {
            Ok(Child {
                id: r.get(0)?,
                classroom_id: r.get(1)?,
                last_name: r.get(2)?,
                first_name: r.get(3)?,
                display_code: r.get(4)?,
                birth_date: r.get(5)?,
                age_band: r.get(6)?,
                active: r.get::<_, i64>(7)? != 0,
            })
        },
    )
    .optional()
    .map_err(CoreError::db)
}

/// The band most of the active roster falls in. Ties resolve in the fixed
/// band order above. Used to back-fill an instance-level instrument binding
/// when no explicit binding exists.
pub fn dominant_band(children: &[Child]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for c in children {
        *counts.entry(c.age_band.as_str()).or_insert(0) += 1;
    }
    let best = counts.values().copied().max()?;
    AGE_BANDS
        .iter()
        .find(|b| counts.get(**b).copied() == Some(best))
        .map(|b| b.to_string())
        .or_else(|| {
            counts
                .iter()
                .find(|(_, n)| **n == best)
                .map(|(b, _)| b.to_string())
        })
}

/// Outcome of comparing the current roster against previously saved rows.
/// Statuses only move; rows are never deleted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterDiff {
    pub to_add: Vec<String>,
    pub to_retire: Vec<String>,
    pub to_reactivate: Vec<String>,
}

impl RosterDiff {
    pub fn is_clean(&self) -> bool {
        self.to_add.is_empty() && self.to_retire.is_empty() && self.to_reactivate.is_empty()
    }
}

/// Pure reconciliation: which children need a row, which rows left the
/// roster, which retired rows came back. Callers decide how a retirement is
/// recorded (`not_in_classroom` at view load, `stale_at_submit` mid-save).
pub fn reconcile(current_ids: &[String], saved_rows: &[AnswerRow]) -> RosterDiff {
    let mut diff = RosterDiff::default();
    for id in current_ids {
        if !saved_rows.iter().any(|r| &r.child_id == id) {
            diff.to_add.push(id.clone());
        }
    }
    for row in saved_rows {
        let present = current_ids.iter().any(|id| id == &row.child_id);
        if present && row.status.is_retired() {
            diff.to_reactivate.push(row.child_id.clone());
        } else if !present && !row.status.is_retired() {
            diff.to_retire.push(row.child_id.clone());
        }
    }
    diff
}

/// View-load reconciliation: departures become `not_in_classroom`, returners
/// go back to `active` with their answers intact.
pub fn apply_view_reconcile(
    conn: &Connection,
    instance_id: &str,
    diff: &RosterDiff,
    now: &str,
) -> Result<(), CoreError> {
    for child_id in &diff.to_retire {
        answers::set_row_status(conn, instance_id, child_id, RowStatus::NotInClassroom, now)?;
    }
    for child_id in &diff.to_reactivate {
        answers::set_row_status(conn, instance_id, child_id, RowStatus::Active, now)?;
    }
    Ok(())
}
