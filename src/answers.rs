use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Post => "post",
        }
    }

    pub fn parse(s: &str) -> Option<Phase> {
        match s {
            "pre" => Some(Phase::Pre),
            "post" => Some(Phase::Post),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    NotStarted,
    InProgress,
    Submitted,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::NotStarted => "not_started",
            InstanceStatus::InProgress => "in_progress",
            InstanceStatus::Submitted => "submitted",
        }
    }

    pub fn parse(s: &str) -> Option<InstanceStatus> {
        match s {
            "not_started" => Some(InstanceStatus::NotStarted),
            "in_progress" => Some(InstanceStatus::InProgress),
            "submitted" => Some(InstanceStatus::Submitted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Active,
    Skipped,
    StaleAtSubmit,
    NotInClassroom,
}

impl RowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RowStatus::Active => "active",
            RowStatus::Skipped => "skipped",
            RowStatus::StaleAtSubmit => "stale_at_submit",
            RowStatus::NotInClassroom => "not_in_classroom",
        }
    }

    pub fn parse(s: &str) -> Option<RowStatus> {
        match s {
            "active" => Some(RowStatus::Active),
            "skipped" => Some(RowStatus::Skipped),
            "stale_at_submit" => Some(RowStatus::StaleAtSubmit),
            "not_in_classroom" => Some(RowStatus::NotInClassroom),
            _ => None,
        }
    }

    /// Rows no longer on the editing surface (the subject left the roster).
    pub fn is_retired(self) -> bool {
        matches!(self, RowStatus::StaleAtSubmit | RowStatus::NotInClassroom)
    }
}

/// One recorded answer: a scalar, or a list for multi-select questions.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerValue {
    One(String),
    Many(Vec<String>),
}

impl AnswerValue {
    /// Lenient conversion from wire/storage JSON. Numbers and bools are taken
    /// as their string rendering; list elements that are not scalars are
    /// dropped. Nulls and objects carry no answer.
    pub fn from_json(v: &Value) -> Option<AnswerValue> {
        match v {
            Value::String(s) => Some(AnswerValue::One(s.clone())),
            Value::Number(n) => Some(AnswerValue::One(n.to_string())),
            Value::Bool(b) => Some(AnswerValue::One(if *b { "1" } else { "0" }.to_string())),
            Value::Array(items) => {
                let vals: Vec<String> = items
                    .iter()
                    .filter_map(|it| match it {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .filter(|s| !s.trim().is_empty())
                    .collect();
                Some(AnswerValue::Many(vals))
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            AnswerValue::One(s) => Value::String(s.clone()),
            AnswerValue::Many(vs) => {
                Value::Array(vs.iter().map(|s| Value::String(s.clone())).collect())
            }
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            AnswerValue::One(s) => Some(s.as_str()),
            AnswerValue::Many(_) => None,
        }
    }

    /// True when the control matching `candidate` should render pre-selected.
    pub fn selects(&self, candidate: &str) -> bool {
        match self {
            AnswerValue::One(s) => s == candidate,
            AnswerValue::Many(vs) => vs.iter().any(|s| s == candidate),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AnswerValue::One(s) => s.trim().is_empty(),
            AnswerValue::Many(vs) => vs.is_empty(),
        }
    }

    pub fn display(&self) -> String {
        match self {
            AnswerValue::One(s) => s.clone(),
            AnswerValue::Many(vs) => vs.join(", "),
        }
    }
}

/// In-memory shape of the per-row answers blob. Serialized to JSON only at
/// the storage boundary below.
pub type AnswerMap = BTreeMap<String, AnswerValue>;

pub fn answers_from_json(raw: &str) -> AnswerMap {
    let mut map = AnswerMap::new();
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return map;
    };
    let Some(obj) = value.as_object() else {
        return map;
    };
    for (k, v) in obj {
        if let Some(av) = AnswerValue::from_json(v) {
            if !av.is_empty() {
                map.insert(k.clone(), av);
            }
        }
    }
    map
}

pub fn answers_to_json(map: &AnswerMap) -> String {
    let obj: serde_json::Map<String, Value> = map
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    Value::Object(obj).to_string()
}

/// Per-(instance, child) answer set with lifecycle metadata.
#[derive(Debug, Clone)]
pub struct AnswerRow {
    pub child_id: String,
    pub answers: AnswerMap,
    pub status: RowStatus,
    pub skip_reason: Option<String>,
    pub frozen_age_band: Option<String>,
    pub frozen_instrument_id: Option<String>,
    pub updated_at: Option<String>,
}

/// Per-(instance, section, item) response for the self-assessment path.
#[derive(Debug, Clone)]
pub struct ResponseRow {
    pub section_key: String,
    pub item_key: String,
    pub value: AnswerValue,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub enrollment_id: String,
    pub classroom_id: String,
    pub activity_ref: String,
    pub phase: Phase,
    pub instrument_id: Option<String>,
    pub instrument_version: Option<i64>,
    pub status: InstanceStatus,
    pub submitted_at: Option<String>,
}

pub fn now_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn today_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

struct RawInstance {
    id: String,
    enrollment_id: String,
    classroom_id: String,
    activity_ref: String,
    phase: String,
    instrument_id: Option<String>,
    instrument_version: Option<i64>,
    status: String,
    submitted_at: Option<String>,
}

const INSTANCE_COLS: &str = "id, enrollment_id, classroom_id, activity_ref, phase, \
     instrument_id, instrument_version, status, submitted_at";

fn instance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawInstance> {
    Ok(RawInstance {
        id: row.get(0)?,
        enrollment_id: row.get(1)?,
        classroom_id: row.get(2)?,
        activity_ref: row.get(3)?,
        phase: row.get(4)?,
        instrument_id: row.get(5)?,
        instrument_version: row.get(6)?,
        status: row.get(7)?,
        submitted_at: row.get(8)?,
    })
}

fn finish_instance(raw: RawInstance) -> Result<Instance, CoreError> {
    let phase = Phase::parse(&raw.phase)
        .ok_or_else(|| CoreError::new("bad_row", format!("unknown phase: {}", raw.phase)))?;
    let status = InstanceStatus::parse(&raw.status)
        .ok_or_else(|| CoreError::new("bad_row", format!("unknown status: {}", raw.status)))?;
    Ok(Instance {
        id: raw.id,
        enrollment_id: raw.enrollment_id,
        classroom_id: raw.classroom_id,
        activity_ref: raw.activity_ref,
        phase,
        instrument_id: raw.instrument_id,
        instrument_version: raw.instrument_version,
        status,
        submitted_at: raw.submitted_at,
    })
}

pub fn load_instance(conn: &Connection, instance_id: &str) -> Result<Option<Instance>, CoreError> {
    let sql = format!(
        "SELECT {} FROM assessment_instances WHERE id = ?",
        INSTANCE_COLS
    );
    let parts = conn
        .query_row(&sql, [instance_id], instance_from_row)
        .optional()
        .map_err(CoreError::db)?;
    match parts {
        Some(p) => Ok(Some(finish_instance(p)?)),
        None => Ok(None),
    }
}

/// Find-or-create in one atomic step: the insert either lands or hits the
/// (enrollment, activity) unique key, and the follow-up select returns the
/// surviving row either way. No dangling instance if the caller never
/// navigates to it.
pub fn find_or_create_instance(
    conn: &Connection,
    enrollment_id: &str,
    classroom_id: &str,
    activity_ref: &str,
    phase: Phase,
) -> Result<Instance, CoreError> {
    let new_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessment_instances(
           id, enrollment_id, classroom_id, activity_ref, phase, status, created_at
         ) VALUES(?, ?, ?, ?, ?, 'not_started', ?)
         ON CONFLICT(enrollment_id, activity_ref) DO NOTHING",
        (
            &new_id,
            enrollment_id,
            classroom_id,
            activity_ref,
            phase.as_str(),
            now_utc(),
        ),
    )
    .map_err(|e| CoreError::new("db_insert_failed", e.to_string()))?;

    let sql = format!(
        "SELECT {} FROM assessment_instances WHERE enrollment_id = ? AND activity_ref = ?",
        INSTANCE_COLS
    );
    let parts = conn
        .query_row(&sql, [enrollment_id, activity_ref], instance_from_row)
        .map_err(CoreError::db)?;
    finish_instance(parts)
}

pub fn bind_instrument(
    conn: &Connection,
    instance_id: &str,
    instrument_id: &str,
    version: i64,
) -> Result<(), CoreError> {
    conn.execute(
        "UPDATE assessment_instances SET instrument_id = ?, instrument_version = ? WHERE id = ?",
        (instrument_id, version, instance_id),
    )
    .map_err(CoreError::db)?;
    Ok(())
}

pub fn set_instance_status(
    conn: &Connection,
    instance_id: &str,
    status: InstanceStatus,
    submitted_at: Option<&str>,
) -> Result<(), CoreError> {
    conn.execute(
        "UPDATE assessment_instances SET status = ?, submitted_at = COALESCE(?, submitted_at)
         WHERE id = ?",
        (status.as_str(), submitted_at, instance_id),
    )
    .map_err(CoreError::db)?;
    Ok(())
}

pub fn load_answer_rows(
    conn: &Connection,
    instance_id: &str,
) -> Result<Vec<AnswerRow>, CoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT child_id, answers, status, skip_reason, frozen_age_band,
                    frozen_instrument_id, updated_at
             FROM answer_rows
             WHERE instance_id = ?
             ORDER BY child_id",
        )
        .map_err(CoreError::db)?;
    stmt.query_map([instance_id], |r| {
        let answers_raw: String = r.get(1)?;
        let status_raw: String = r.get(2)?;
        Ok(AnswerRow {
            child_id: r.get(0)?,
            answers: answers_from_json(&answers_raw),
            status: RowStatus::parse(&status_raw).unwrap_or(RowStatus::Active),
            skip_reason: r.get(3)?,
            frozen_age_band: r.get(4)?,
            frozen_instrument_id: r.get(5)?,
            updated_at: r.get(6)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CoreError::db)
}

/// Last write wins per (instance, child); the unique key makes repeat saves
/// land on the same row.
pub fn upsert_answer_row(
    conn: &Connection,
    instance_id: &str,
    row: &AnswerRow,
    now: &str,
) -> Result<(), CoreError> {
    let row_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO answer_rows(
           id, instance_id, child_id, answers, status, skip_reason,
           frozen_age_band, frozen_instrument_id, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(instance_id, child_id) DO UPDATE SET
           answers = excluded.answers,
           status = excluded.status,
           skip_reason = excluded.skip_reason,
           frozen_age_band = excluded.frozen_age_band,
           frozen_instrument_id = excluded.frozen_instrument_id,
           updated_at = excluded.updated_at",
        (
            &row_id,
            instance_id,
            &row.child_id,
            answers_to_json(&row.answers),
            row.status.as_str(),
            row.skip_reason.as_deref(),
            row.frozen_age_band.as_deref(),
            row.frozen_instrument_id.as_deref(),
            now,
        ),
    )
    .map_err(|e| CoreError::new("db_insert_failed", e.to_string()))?;
    Ok(())
}

pub fn set_row_status(
    conn: &Connection,
    instance_id: &str,
    child_id: &str,
    status: RowStatus,
    now: &str,
) -> Result<(), CoreError> {
    conn.execute(
        "UPDATE answer_rows SET status = ?, updated_at = ?
         WHERE instance_id = ? AND child_id = ?",
        (status.as_str(), now, instance_id, child_id),
    )
    .map_err(CoreError::db)?;
    Ok(())
}

pub fn load_response_rows(
    conn: &Connection,
    instance_id: &str,
) -> Result<Vec<ResponseRow>, CoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT section_key, item_key, value, updated_at
             FROM self_responses
             WHERE instance_id = ?
             ORDER BY section_key, item_key",
        )
        .map_err(CoreError::db)?;
    stmt.query_map([instance_id], |r| {
        let value_raw: String = r.get(2)?;
        let value = serde_json::from_str::<Value>(&value_raw)
            .ok()
            .as_ref()
            .and_then(AnswerValue::from_json)
            .unwrap_or_else(|| AnswerValue::One(String::new()));
        Ok(ResponseRow {
            section_key: r.get(0)?,
            item_key: r.get(1)?,
            value,
            updated_at: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CoreError::db)
}

pub fn upsert_response_row(
    conn: &Connection,
    instance_id: &str,
    row: &ResponseRow,
    now: &str,
) -> Result<(), CoreError> {
    let row_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO self_responses(id, instance_id, section_key, item_key, value, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(instance_id, section_key, item_key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        (
            &row_id,
            instance_id,
            &row.section_key,
            &row.item_key,
            row.value.to_json().to_string(),
            now,
        ),
    )
    .map_err(|e| CoreError::new("db_insert_failed", e.to_string()))?;
    Ok(())
}
