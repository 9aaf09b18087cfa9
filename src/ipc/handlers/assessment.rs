use rusqlite::Connection;
use serde_json::{json, Value};

use crate::answers::{self, AnswerMap};
use crate::forms;
use crate::instrument::{self, InstrumentRecord};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{core_err, db_conn, request_context, required_str};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use crate::summary;
use crate::workflow::{self, ChildrenOpen, OpenMode, SaveAction};

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "assessment.open" => assessment_open(state, req),
        "assessment.save" => assessment_save(state, req),
        "assessment.rows" => assessment_rows(state, req),
        "assessment.summary" => assessment_summary(state, req),
        _ => return None,
    };
    Some(resp.unwrap_or_else(|e| e))
}

const BLOCKED_REASON: &str =
    "No matching instrument is configured for this assessment. Ask an administrator \
     to register one for this age group.";

fn record_meta(rec: &InstrumentRecord) -> Value {
    json!({
        "id": rec.id,
        "name": rec.name,
        "instrumentType": rec.instrument_type,
        "version": rec.version,
    })
}

/// Markup plus the control contract for whatever view the instance is in.
/// Submitted instances render the read-only summary over the full roster so
/// departed children keep their names.
fn render_children(
    conn: &Connection,
    req: &Request,
    open: &ChildrenOpen,
) -> Result<(String, Option<forms::ClientContract>), Value> {
    match (open.mode, &open.record) {
        (OpenMode::Form, Some(rec)) => {
            let markup =
                forms::render_children_form(rec, &open.children, &open.rows, &open.instance);
            let contract = forms::children_contract(&rec.def, &open.children);
            Ok((markup, Some(contract)))
        }
        (OpenMode::Summary, Some(rec)) => {
            let all = roster::load_children(conn, &open.instance.classroom_id, true)
                .map_err(|e| core_err(req, e))?;
            let markup = summary::render_children_summary(rec, &all, &open.rows, &open.instance);
            Ok((markup, None))
        }
        _ => Ok((forms::render_blocked(BLOCKED_REASON), None)),
    }
}

fn assessment_open(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let ctx = request_context(conn, req)?;
    let enrollment_id = required_str(req, "enrollmentId")?;
    let activity_ref = required_str(req, "activityRef")?;

    let open = workflow::open_children_assessment(conn, &ctx, &enrollment_id, &activity_ref)
        .map_err(|e| core_err(req, e))?;
    let (markup, contract) = render_children(conn, req, &open)?;

    Ok(ok(
        &req.id,
        json!({
            "instanceId": open.instance.id,
            "phase": open.instance.phase.as_str(),
            "status": open.instance.status.as_str(),
            "mode": open.mode.as_str(),
            "instrument": open.record.as_ref().map(record_meta),
            "markup": markup,
            "contract": contract,
        }),
    ))
}

fn assessment_save(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let ctx = request_context(conn, req)?;
    let instance_id = required_str(req, "instanceId")?;
    let action_raw = required_str(req, "action")?;
    let action = SaveAction::parse(&action_raw).ok_or_else(|| {
        err(&req.id, "bad_params", "action must be draft or submit", None)
    })?;
    let raw_answers = req.params.get("answers").cloned().unwrap_or(Value::Null);

    let outcome = workflow::save_children_assessment(conn, &ctx, &instance_id, action, &raw_answers)
        .map_err(|e| core_err(req, e))?;

    if !outcome.incomplete.is_empty() {
        // The merge already committed, so the entered answers survive as a
        // draft even though the submit was refused.
        let details = json!({
            "incomplete": outcome.incomplete,
            "staleAtSubmit": outcome.stale_at_submit,
        });
        return Err(err(
            &req.id,
            "validation_incomplete",
            "required answers are missing",
            Some(details),
        ));
    }

    let open = workflow::open_children_assessment(
        conn,
        &ctx,
        &outcome.instance.enrollment_id,
        &outcome.instance.activity_ref,
    )
    .map_err(|e| core_err(req, e))?;
    let (markup, contract) = render_children(conn, req, &open)?;

    Ok(ok(
        &req.id,
        json!({
            "instanceId": open.instance.id,
            "status": open.instance.status.as_str(),
            "mode": open.mode.as_str(),
            "submitted": outcome.submitted,
            "staleAtSubmit": outcome.stale_at_submit,
            "markup": markup,
            "contract": contract,
        }),
    ))
}

fn answers_value(map: &AnswerMap) -> Value {
    let mut obj = serde_json::Map::new();
    for (key, value) in map {
        obj.insert(key.clone(), value.to_json());
    }
    Value::Object(obj)
}

fn assessment_rows(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let ctx = request_context(conn, req)?;
    let instance_id = required_str(req, "instanceId")?;

    let instance = answers::load_instance(conn, &instance_id)
        .map_err(|e| core_err(req, e))?
        .ok_or_else(|| err(&req.id, "not_found", "assessment instance not found", None))?;
    workflow::authorize_enrollment(conn, &ctx, &instance.enrollment_id)
        .map_err(|e| core_err(req, e))?;

    let rows = answers::load_answer_rows(conn, &instance_id).map_err(|e| core_err(req, e))?;
    let out: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "childId": row.child_id,
                "answers": answers_value(&row.answers),
                "status": row.status.as_str(),
                "skipReason": row.skip_reason,
                "frozenAgeBand": row.frozen_age_band,
                "frozenInstrumentId": row.frozen_instrument_id,
                "updatedAt": row.updated_at,
            })
        })
        .collect();

    Ok(ok(
        &req.id,
        json!({
            "instanceId": instance.id,
            "status": instance.status.as_str(),
            "rows": out,
        }),
    ))
}

fn assessment_summary(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let ctx = request_context(conn, req)?;
    let instance_id = required_str(req, "instanceId")?;

    let instance = answers::load_instance(conn, &instance_id)
        .map_err(|e| core_err(req, e))?
        .ok_or_else(|| err(&req.id, "not_found", "assessment instance not found", None))?;
    workflow::authorize_enrollment(conn, &ctx, &instance.enrollment_id)
        .map_err(|e| core_err(req, e))?;

    let record = match &instance.instrument_id {
        Some(id) => instrument::load_instrument(conn, id).map_err(|e| core_err(req, e))?,
        None => None,
    };
    let rows = answers::load_answer_rows(conn, &instance_id).map_err(|e| core_err(req, e))?;
    let markup = match &record {
        Some(rec) => {
            let all = roster::load_children(conn, &instance.classroom_id, true)
                .map_err(|e| core_err(req, e))?;
            summary::render_children_summary(rec, &all, &rows, &instance)
        }
        None => forms::render_blocked(BLOCKED_REASON),
    };

    Ok(ok(
        &req.id,
        json!({
            "instanceId": instance.id,
            "status": instance.status.as_str(),
            "markup": markup,
        }),
    ))
}
