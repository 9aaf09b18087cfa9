use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::answers::{
    self, AnswerMap, AnswerRow, AnswerValue, Instance, InstanceStatus, Phase, ResponseRow,
    RowStatus,
};
use crate::errors::CoreError;
use crate::instrument::{self, value_matches, InstrumentDef, InstrumentRecord};
use crate::resolve;
use crate::roster::{self, Child};

/// Reserved per-child control keys in the children payload. Everything else
/// under a child entry is a question answer.
pub const SKIP_KEY: &str = "_skip";
pub const SKIP_REASON_KEY: &str = "_skip_reason";
pub const AGE_GROUP_KEY: &str = "_age_group";
pub const INSTRUMENT_KEY: &str = "_instrument_id";

pub const CATEGORY_CHILDREN: &str = "children";
pub const CATEGORY_EDUCATOR: &str = "educator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Educator,
    Manager,
}

impl UserRole {
    pub fn parse(s: &str) -> Option<UserRole> {
        match s {
            "educator" => Some(UserRole::Educator),
            "manager" => Some(UserRole::Manager),
            _ => None,
        }
    }
}

/// Caller identity, established once at the request boundary.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: String,
    pub role: UserRole,
}

pub fn load_context(conn: &Connection, user_id: &str) -> Result<RequestContext, CoreError> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(CoreError::db)?;
    let role = role
        .and_then(|r| UserRole::parse(&r))
        .ok_or_else(|| CoreError::new("unauthorized", "unknown user"))?;
    Ok(RequestContext {
        user_id: user_id.to_string(),
        role,
    })
}

/// Only the enrollment owner or a manager may touch its instances. Returns
/// the enrollment's classroom id for roster loading.
pub fn authorize_enrollment(
    conn: &Connection,
    ctx: &RequestContext,
    enrollment_id: &str,
) -> Result<String, CoreError> {
    let found: Option<(String, String)> = conn
        .query_row(
            "SELECT classroom_id, owner_user_id FROM enrollments WHERE id = ?",
            [enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(CoreError::db)?;
    let (classroom_id, owner) =
        found.ok_or_else(|| CoreError::new("not_found", "enrollment not found"))?;
    if ctx.role != UserRole::Manager && owner != ctx.user_id {
        return Err(CoreError::new(
            "unauthorized",
            "not the owner of this enrollment",
        ));
    }
    Ok(classroom_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAction {
    Draft,
    Submit,
}

impl SaveAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SaveAction::Draft => "draft",
            SaveAction::Submit => "submit",
        }
    }

    pub fn parse(s: &str) -> Option<SaveAction> {
        match s {
            "draft" => Some(SaveAction::Draft),
            "submit" => Some(SaveAction::Submit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Activity {
    pub activity_ref: String,
    pub kind: String,
    pub phase: Phase,
    pub instrument_id: Option<String>,
    pub title: Option<String>,
}

pub fn load_activity(conn: &Connection, activity_ref: &str) -> Result<Option<Activity>, CoreError> {
    let found = conn
        .query_row(
            "SELECT ref, kind, phase, instrument_id, title FROM activities WHERE ref = ?",
            [activity_ref],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()
        .map_err(CoreError::db)?;
    match found {
        Some((activity_ref, kind, phase_raw, instrument_id, title)) => {
            let phase = Phase::parse(&phase_raw).ok_or_else(|| {
                CoreError::new("bad_row", format!("unknown phase: {}", phase_raw))
            })?;
            Ok(Some(Activity {
                activity_ref,
                kind,
                phase,
                instrument_id,
                title,
            }))
        }
        None => Ok(None),
    }
}

fn boolish(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.trim(), "1" | "true" | "on" | "yes"),
        _ => false,
    }
}

/// One child's slice of the submitted form.
#[derive(Debug, Clone, Default)]
pub struct ChildPayload {
    pub answers: AnswerMap,
    pub skip: bool,
    pub skip_reason: Option<String>,
    pub age_band: Option<String>,
    pub instrument_id: Option<String>,
}

pub fn parse_children_payload(raw: &Value) -> BTreeMap<String, ChildPayload> {
    let mut out = BTreeMap::new();
    let Some(children) = raw.as_object() else {
        return out;
    };
    for (child_id, fields) in children {
        let Some(fields) = fields.as_object() else {
            continue;
        };
        let mut entry = ChildPayload::default();
        for (key, value) in fields {
            match key.as_str() {
                SKIP_KEY => entry.skip = boolish(value),
                SKIP_REASON_KEY => {
                    entry.skip_reason = value
                        .as_str()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                }
                AGE_GROUP_KEY => {
                    entry.age_band = value
                        .as_str()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                }
                INSTRUMENT_KEY => {
                    entry.instrument_id = value
                        .as_str()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                }
                _ => {
                    if let Some(av) = AnswerValue::from_json(value) {
                        if !av.is_empty() {
                            entry.answers.insert(key.clone(), av);
                        }
                    }
                }
            }
        }
        out.insert(child_id.clone(), entry);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncompleteAnswer {
    pub child_id: String,
    pub question_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncompleteItem {
    pub section_key: String,
    pub item_key: String,
}

fn load_frozen_defs(
    conn: &Connection,
    rows: &[AnswerRow],
) -> Result<BTreeMap<String, InstrumentDef>, CoreError> {
    let mut map = BTreeMap::new();
    for row in rows {
        if let Some(id) = &row.frozen_instrument_id {
            if !map.contains_key(id) {
                if let Some(rec) = instrument::load_instrument(conn, id)? {
                    map.insert(id.clone(), rec.def);
                }
            }
        }
    }
    Ok(map)
}

/// Submit-time completeness check. Every active roster child must either
/// have every required question answered against the instrument frozen into
/// their row, or be skipped with a reason. Retired rows are exempt.
pub fn validate_children(
    fallback: &InstrumentDef,
    frozen_defs: &BTreeMap<String, InstrumentDef>,
    children: &[Child],
    rows: &[AnswerRow],
) -> Vec<IncompleteAnswer> {
    let mut incomplete = Vec::new();
    for child in children {
        let row = rows.iter().find(|r| r.child_id == child.id);
        match row {
            Some(row) if row.status.is_retired() => {}
            Some(row) if row.status == RowStatus::Skipped => {
                let has_reason = row
                    .skip_reason
                    .as_deref()
                    .map(|s| !s.trim().is_empty())
                    .unwrap_or(false);
                if !has_reason {
                    incomplete.push(IncompleteAnswer {
                        child_id: child.id.clone(),
                        question_key: SKIP_REASON_KEY.to_string(),
                    });
                }
            }
            Some(row) => {
                let def = row
                    .frozen_instrument_id
                    .as_deref()
                    .and_then(|id| frozen_defs.get(id))
                    .unwrap_or(fallback);
                for q in def.questions.iter().filter(|q| q.required) {
                    let ok = row
                        .answers
                        .get(&q.key)
                        .map(|v| value_matches(q, v))
                        .unwrap_or(false);
                    if !ok {
                        incomplete.push(IncompleteAnswer {
                            child_id: child.id.clone(),
                            question_key: q.key.clone(),
                        });
                    }
                }
            }
            None => {
                for q in fallback.questions.iter().filter(|q| q.required) {
                    incomplete.push(IncompleteAnswer {
                        child_id: child.id.clone(),
                        question_key: q.key.clone(),
                    });
                }
            }
        }
    }
    incomplete
}

/// Bind an instrument to the instance if none is bound yet. The band for
/// resolution is the dominant band of the active roster; the activity's
/// explicit binding takes priority inside `resolve`.
pub fn ensure_instance_binding(
    conn: &Connection,
    instance: &Instance,
    children: &[Child],
    category: &str,
    on_date: &str,
) -> Result<Option<(String, i64)>, CoreError> {
    if let Some(id) = &instance.instrument_id {
        return Ok(Some((id.clone(), instance.instrument_version.unwrap_or(1))));
    }
    let activity = load_activity(conn, &instance.activity_ref)?;
    let explicit = activity.and_then(|a| a.instrument_id);
    let band = roster::dominant_band(children);
    let resolved = resolve::resolve(conn, category, band.as_deref(), explicit.as_deref(), on_date)?;
    if let Some(r) = &resolved {
        answers::bind_instrument(conn, &instance.id, &r.instrument_id, r.version)?;
    }
    Ok(resolved.map(|r| (r.instrument_id, r.version)))
}

fn merge_child_row(
    existing: Option<&AnswerRow>,
    child_id: &str,
    entry: &ChildPayload,
    instance: &Instance,
    children: &[Child],
) -> AnswerRow {
    let mut row = existing.cloned().unwrap_or_else(|| AnswerRow {
        child_id: child_id.to_string(),
        answers: AnswerMap::new(),
        status: RowStatus::Active,
        skip_reason: None,
        frozen_age_band: None,
        frozen_instrument_id: None,
        updated_at: None,
    });

    // The posted grid carries the full current control state for the child,
    // so a non-empty payload replaces the stored map wholesale. An empty
    // payload (child skipped with inputs disabled, or untouched) keeps what
    // was there.
    if !entry.answers.is_empty() {
        row.answers = entry.answers.clone();
    }
    row.status = if entry.skip {
        RowStatus::Skipped
    } else {
        RowStatus::Active
    };
    row.skip_reason = if entry.skip {
        entry.skip_reason.clone()
    } else {
        None
    };

    let child_band = children
        .iter()
        .find(|c| c.id == child_id)
        .map(|c| c.age_band.clone());
    row.frozen_age_band = entry
        .age_band
        .clone()
        .or_else(|| row.frozen_age_band.clone())
        .or(child_band);
    row.frozen_instrument_id = entry
        .instrument_id
        .clone()
        .or_else(|| row.frozen_instrument_id.clone())
        .or_else(|| instance.instrument_id.clone());
    row
}

#[derive(Debug, Clone)]
pub struct ChildrenSaveOutcome {
    pub instance: Instance,
    pub incomplete: Vec<IncompleteAnswer>,
    pub stale_at_submit: Vec<String>,
    pub submitted: bool,
}

/// The submission state machine for the children grid. One transaction:
/// roster alignment first, then the merge, then submit validation. Commits
/// even when validation blocks the submit, so entered answers survive as a
/// draft.
pub fn save_children_assessment(
    conn: &Connection,
    ctx: &RequestContext,
    instance_id: &str,
    action: SaveAction,
    raw_answers: &Value,
) -> Result<ChildrenSaveOutcome, CoreError> {
    let instance = answers::load_instance(conn, instance_id)?
        .ok_or_else(|| CoreError::new("not_found", "assessment instance not found"))?;
    authorize_enrollment(conn, ctx, &instance.enrollment_id)?;
    if instance.status == InstanceStatus::Submitted {
        return Err(CoreError::new(
            "already_submitted",
            "assessment is already submitted and no longer accepts writes",
        ));
    }

    let payload = parse_children_payload(raw_answers);
    let now = answers::now_utc();

    let tx = conn.unchecked_transaction().map_err(CoreError::db)?;

    let children = roster::load_children(&tx, &instance.classroom_id, false)?;
    let binding = ensure_instance_binding(
        &tx,
        &instance,
        &children,
        CATEGORY_CHILDREN,
        &answers::today_utc(),
    )?;
    if action == SaveAction::Submit && binding.is_none() {
        return Err(CoreError::new(
            "unresolved_instrument",
            "no instrument could be resolved for this assessment",
        ));
    }
    let instance = answers::load_instance(&tx, instance_id)?
        .ok_or_else(|| CoreError::new("not_found", "assessment instance not found"))?;

    let current_ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
    let saved = answers::load_answer_rows(&tx, instance_id)?;

    // Roster alignment lands before the merge so a child added and answered
    // in the same request is not lost. Rows the payload re-asserts get their
    // status from the merge below instead.
    let diff = roster::reconcile(&current_ids, &saved);
    for child_id in &diff.to_retire {
        if !payload.contains_key(child_id) {
            answers::set_row_status(&tx, instance_id, child_id, RowStatus::NotInClassroom, &now)?;
        }
    }
    for child_id in &diff.to_reactivate {
        if !payload.contains_key(child_id) {
            answers::set_row_status(&tx, instance_id, child_id, RowStatus::Active, &now)?;
        }
    }

    let mut stale_at_submit = Vec::new();
    for (child_id, entry) in &payload {
        let existing = saved.iter().find(|r| &r.child_id == child_id);
        let mut row = merge_child_row(existing, child_id, entry, &instance, &children);
        if !current_ids.iter().any(|id| id == child_id) {
            // Present when the form rendered, gone from the roster now.
            row.status = RowStatus::StaleAtSubmit;
            stale_at_submit.push(child_id.clone());
        }
        answers::upsert_answer_row(&tx, instance_id, &row, &now)?;
    }

    let mut incomplete = Vec::new();
    if action == SaveAction::Submit {
        let rows_after = answers::load_answer_rows(&tx, instance_id)?;
        let fallback_def = match &instance.instrument_id {
            Some(id) => instrument::load_instrument(&tx, id)?
                .map(|r| r.def)
                .unwrap_or_default(),
            None => InstrumentDef::default(),
        };
        let frozen_defs = load_frozen_defs(&tx, &rows_after)?;
        incomplete = validate_children(&fallback_def, &frozen_defs, &children, &rows_after);
    }

    let submitted = action == SaveAction::Submit && incomplete.is_empty();
    if submitted {
        answers::set_instance_status(&tx, instance_id, InstanceStatus::Submitted, Some(&now))?;
    } else if instance.status == InstanceStatus::NotStarted {
        answers::set_instance_status(&tx, instance_id, InstanceStatus::InProgress, None)?;
    }

    tx.commit().map_err(CoreError::db)?;

    let instance = answers::load_instance(conn, instance_id)?
        .ok_or_else(|| CoreError::new("not_found", "assessment instance not found"))?;
    info!(
        instance = instance_id,
        action = action.as_str(),
        submitted,
        incomplete = incomplete.len(),
        stale = stale_at_submit.len(),
        "children assessment saved"
    );
    Ok(ChildrenSaveOutcome {
        instance,
        incomplete,
        stale_at_submit,
        submitted,
    })
}

/// Parse the self-assessment payload. Retrospective items post as
/// `{"now": value}`; only the "now" half is ever stored. Unknown sections
/// and items are dropped.
pub fn parse_self_payload(def: &InstrumentDef, resp: &Value) -> Vec<ResponseRow> {
    let mut rows = Vec::new();
    let Some(sections) = resp.as_object() else {
        return rows;
    };
    for (section_key, items) in sections {
        let Some(section) = def.section(section_key) else {
            continue;
        };
        let Some(items) = items.as_object() else {
            continue;
        };
        for (item_key, raw) in items {
            if !section.items.iter().any(|q| &q.key == item_key) {
                continue;
            }
            let value_raw = match raw {
                Value::Object(m) => m.get("now").cloned().unwrap_or(Value::Null),
                other => other.clone(),
            };
            if let Some(value) = AnswerValue::from_json(&value_raw) {
                if !value.is_empty() {
                    rows.push(ResponseRow {
                        section_key: section_key.clone(),
                        item_key: item_key.clone(),
                        value,
                        updated_at: None,
                    });
                }
            }
        }
    }
    rows
}

/// Required-item check for the sectioned instrument, same trust boundary as
/// the children path. Also reports the first section with a gap so the form
/// can navigate there.
pub fn validate_self(
    def: &InstrumentDef,
    rows: &[ResponseRow],
) -> (Vec<IncompleteItem>, Option<String>) {
    let mut incomplete = Vec::new();
    let mut first_section = None;
    for section in &def.sections {
        let mut section_hit = false;
        for item in section.items.iter().filter(|q| q.required) {
            let ok = rows
                .iter()
                .find(|r| r.section_key == section.key && r.item_key == item.key)
                .map(|r| value_matches(item, &r.value))
                .unwrap_or(false);
            if !ok {
                incomplete.push(IncompleteItem {
                    section_key: section.key.clone(),
                    item_key: item.key.clone(),
                });
                section_hit = true;
            }
        }
        if section_hit && first_section.is_none() {
            first_section = Some(section.key.clone());
        }
    }
    (incomplete, first_section)
}

#[derive(Debug, Clone)]
pub struct SelfSaveOutcome {
    pub instance: Instance,
    pub incomplete: Vec<IncompleteItem>,
    pub first_incomplete_section: Option<String>,
    pub submitted: bool,
}

pub fn save_self_assessment(
    conn: &Connection,
    ctx: &RequestContext,
    instance_id: &str,
    action: SaveAction,
    resp: &Value,
) -> Result<SelfSaveOutcome, CoreError> {
    let instance = answers::load_instance(conn, instance_id)?
        .ok_or_else(|| CoreError::new("not_found", "assessment instance not found"))?;
    authorize_enrollment(conn, ctx, &instance.enrollment_id)?;
    if instance.status == InstanceStatus::Submitted {
        return Err(CoreError::new(
            "already_submitted",
            "assessment is already submitted and no longer accepts writes",
        ));
    }

    let now = answers::now_utc();
    let tx = conn.unchecked_transaction().map_err(CoreError::db)?;

    let binding = ensure_instance_binding(
        &tx,
        &instance,
        &[],
        CATEGORY_EDUCATOR,
        &answers::today_utc(),
    )?;
    let Some((instrument_id, _)) = binding else {
        return Err(CoreError::new(
            "unresolved_instrument",
            "no instrument could be resolved for this assessment",
        ));
    };
    let def = instrument::load_instrument(&tx, &instrument_id)?
        .map(|r| r.def)
        .unwrap_or_default();

    for row in parse_self_payload(&def, resp) {
        answers::upsert_response_row(&tx, instance_id, &row, &now)?;
    }

    let (incomplete, first_incomplete_section) = if action == SaveAction::Submit {
        let rows_after = answers::load_response_rows(&tx, instance_id)?;
        validate_self(&def, &rows_after)
    } else {
        (Vec::new(), None)
    };

    let submitted = action == SaveAction::Submit && incomplete.is_empty();
    if submitted {
        answers::set_instance_status(&tx, instance_id, InstanceStatus::Submitted, Some(&now))?;
    } else if instance.status == InstanceStatus::NotStarted {
        answers::set_instance_status(&tx, instance_id, InstanceStatus::InProgress, None)?;
    }

    tx.commit().map_err(CoreError::db)?;

    let instance = answers::load_instance(conn, instance_id)?
        .ok_or_else(|| CoreError::new("not_found", "assessment instance not found"))?;
    info!(
        instance = instance_id,
        action = action.as_str(),
        submitted,
        incomplete = incomplete.len(),
        "self assessment saved"
    );
    Ok(SelfSaveOutcome {
        instance,
        incomplete,
        first_incomplete_section,
        submitted,
    })
}

/// Before/now pair for one retrospective item, built by an explicit join of
/// the matching pre-phase instance's stored responses against this one's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrospectiveItemValue {
    pub before: Option<AnswerValue>,
    pub now: Option<AnswerValue>,
}

pub type RetroMap = BTreeMap<(String, String), RetrospectiveItemValue>;

pub fn retrospective_join(
    def: &InstrumentDef,
    pre_rows: &[ResponseRow],
    cur_rows: &[ResponseRow],
) -> RetroMap {
    let find = |rows: &[ResponseRow], s: &str, i: &str| {
        rows.iter()
            .find(|r| r.section_key == s && r.item_key == i)
            .map(|r| r.value.clone())
    };
    let mut map = RetroMap::new();
    for section in def.sections.iter().filter(|s| s.retrospective) {
        for item in &section.items {
            map.insert(
                (section.key.clone(), item.key.clone()),
                RetrospectiveItemValue {
                    before: find(pre_rows, &section.key, &item.key),
                    now: find(cur_rows, &section.key, &item.key),
                },
            );
        }
    }
    map
}

/// The pre-phase instance whose responses feed the retrospective "before"
/// column: same enrollment, phase `pre`, same instrument type when this
/// instance is bound, else the newest pre instance for the enrollment.
pub fn find_pre_instance(
    conn: &Connection,
    instance: &Instance,
) -> Result<Option<Instance>, CoreError> {
    let typed: Option<String> = match &instance.instrument_id {
        Some(cur_id) => conn
            .query_row(
                "SELECT ai.id
                 FROM assessment_instances ai
                 JOIN instruments pre ON pre.id = ai.instrument_id
                 JOIN instruments cur ON cur.id = ?2
                 WHERE ai.enrollment_id = ?1 AND ai.phase = 'pre'
                   AND pre.instrument_type = cur.instrument_type
                 ORDER BY ai.created_at DESC LIMIT 1",
                (&instance.enrollment_id, cur_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(CoreError::db)?,
        None => None,
    };
    let id: Option<String> = match typed {
        Some(id) => Some(id),
        None => conn
            .query_row(
                "SELECT id FROM assessment_instances
                 WHERE enrollment_id = ? AND phase = 'pre'
                 ORDER BY created_at DESC LIMIT 1",
                [&instance.enrollment_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(CoreError::db)?,
    };
    match id {
        Some(id) => answers::load_instance(conn, &id),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Form,
    Summary,
    Blocked,
}

impl OpenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpenMode::Form => "form",
            OpenMode::Summary => "summary",
            OpenMode::Blocked => "blocked",
        }
    }
}

#[derive(Debug)]
pub struct ChildrenOpen {
    pub instance: Instance,
    pub children: Vec<Child>,
    pub rows: Vec<AnswerRow>,
    pub record: Option<InstrumentRecord>,
    pub mode: OpenMode,
}

/// View-load path for the children grid: find-or-create the instance,
/// back-fill the instrument binding, reconcile the roster, and decide what
/// the caller renders. Submitted instances keep their row statuses as
/// frozen at submit.
pub fn open_children_assessment(
    conn: &Connection,
    ctx: &RequestContext,
    enrollment_id: &str,
    activity_ref: &str,
) -> Result<ChildrenOpen, CoreError> {
    let activity = load_activity(conn, activity_ref)?
        .ok_or_else(|| CoreError::new("not_found", "activity not found"))?;
    if activity.kind != "children" {
        return Err(CoreError::new(
            "bad_params",
            "activity is not a children assessment",
        ));
    }
    let classroom_id = authorize_enrollment(conn, ctx, enrollment_id)?;

    let instance = answers::find_or_create_instance(
        conn,
        enrollment_id,
        &classroom_id,
        activity_ref,
        activity.phase,
    )?;
    let children = roster::load_children(conn, &classroom_id, false)?;
    let binding =
        ensure_instance_binding(conn, &instance, &children, CATEGORY_CHILDREN, &answers::today_utc())?;
    let instance = answers::load_instance(conn, &instance.id)?
        .ok_or_else(|| CoreError::new("not_found", "assessment instance not found"))?;

    let mut rows = answers::load_answer_rows(conn, &instance.id)?;
    if instance.status != InstanceStatus::Submitted {
        let current_ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
        let diff = roster::reconcile(&current_ids, &rows);
        if !diff.is_clean() {
            roster::apply_view_reconcile(conn, &instance.id, &diff, &answers::now_utc())?;
            rows = answers::load_answer_rows(conn, &instance.id)?;
        }
    }

    let record = match &binding {
        Some((id, _)) => instrument::load_instrument(conn, id)?,
        None => None,
    };
    let mode = if instance.status == InstanceStatus::Submitted {
        OpenMode::Summary
    } else if record.is_none() {
        OpenMode::Blocked
    } else {
        OpenMode::Form
    };

    Ok(ChildrenOpen {
        instance,
        children,
        rows,
        record,
        mode,
    })
}

#[derive(Debug)]
pub struct SelfOpen {
    pub instance: Instance,
    pub record: Option<InstrumentRecord>,
    pub rows: Vec<ResponseRow>,
    pub retro: RetroMap,
    pub mode: OpenMode,
}

pub fn open_self_assessment(
    conn: &Connection,
    ctx: &RequestContext,
    enrollment_id: &str,
    activity_ref: &str,
) -> Result<SelfOpen, CoreError> {
    let activity = load_activity(conn, activity_ref)?
        .ok_or_else(|| CoreError::new("not_found", "activity not found"))?;
    if activity.kind != "educator" {
        return Err(CoreError::new(
            "bad_params",
            "activity is not a self assessment",
        ));
    }
    let classroom_id = authorize_enrollment(conn, ctx, enrollment_id)?;

    let instance = answers::find_or_create_instance(
        conn,
        enrollment_id,
        &classroom_id,
        activity_ref,
        activity.phase,
    )?;
    let binding =
        ensure_instance_binding(conn, &instance, &[], CATEGORY_EDUCATOR, &answers::today_utc())?;
    let instance = answers::load_instance(conn, &instance.id)?
        .ok_or_else(|| CoreError::new("not_found", "assessment instance not found"))?;

    let record = match &binding {
        Some((id, _)) => instrument::load_instrument(conn, id)?,
        None => None,
    };
    let rows = answers::load_response_rows(conn, &instance.id)?;

    let retro = match (&record, instance.phase) {
        (Some(rec), Phase::Post) => {
            let pre_rows = match find_pre_instance(conn, &instance)? {
                Some(pre) => answers::load_response_rows(conn, &pre.id)?,
                None => Vec::new(),
            };
            retrospective_join(&rec.def, &pre_rows, &rows)
        }
        _ => RetroMap::new(),
    };

    let mode = if instance.status == InstanceStatus::Submitted {
        OpenMode::Summary
    } else if record.is_none() {
        OpenMode::Blocked
    } else {
        OpenMode::Form
    };

    Ok(SelfOpen {
        instance,
        record,
        rows,
        retro,
        mode,
    })
}
