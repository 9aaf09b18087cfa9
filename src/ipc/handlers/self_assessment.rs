use serde_json::{json, Value};

use crate::answers;
use crate::forms;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{core_err, db_conn, request_context, required_str};
use crate::ipc::types::{AppState, Request};
use crate::summary;
use crate::workflow::{self, OpenMode, SaveAction, SelfOpen};

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "selfAssessment.open" => self_open(state, req),
        "selfAssessment.save" => self_save(state, req),
        "selfAssessment.rows" => self_rows(state, req),
        _ => return None,
    };
    Some(resp.unwrap_or_else(|e| e))
}

const BLOCKED_REASON: &str =
    "No self-assessment instrument is configured for this activity. Ask an \
     administrator to register one.";

fn render_self(open: &SelfOpen) -> (String, Option<forms::ClientContract>) {
    match (open.mode, &open.record) {
        (OpenMode::Form, Some(rec)) => {
            let markup = forms::render_self_form(rec, &open.rows, &open.retro, &open.instance);
            let contract = forms::self_contract(&rec.def, open.instance.phase);
            (markup, Some(contract))
        }
        (OpenMode::Summary, Some(rec)) => {
            let markup = summary::render_self_summary(rec, &open.rows, &open.retro, &open.instance);
            (markup, None)
        }
        _ => (forms::render_blocked(BLOCKED_REASON), None),
    }
}

fn open_body(open: &SelfOpen) -> Value {
    let (markup, contract) = render_self(open);
    let instrument = open.record.as_ref().map(|rec| {
        json!({
            "id": rec.id,
            "name": rec.name,
            "instrumentType": rec.instrument_type,
            "version": rec.version,
        })
    });
    json!({
        "instanceId": open.instance.id,
        "phase": open.instance.phase.as_str(),
        "status": open.instance.status.as_str(),
        "mode": open.mode.as_str(),
        "instrument": instrument,
        "markup": markup,
        "contract": contract,
    })
}

fn self_open(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let ctx = request_context(conn, req)?;
    let enrollment_id = required_str(req, "enrollmentId")?;
    let activity_ref = required_str(req, "activityRef")?;

    let open = workflow::open_self_assessment(conn, &ctx, &enrollment_id, &activity_ref)
        .map_err(|e| core_err(req, e))?;
    Ok(ok(&req.id, open_body(&open)))
}

fn self_save(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let ctx = request_context(conn, req)?;
    let instance_id = required_str(req, "instanceId")?;
    let action_raw = required_str(req, "action")?;
    let action = SaveAction::parse(&action_raw).ok_or_else(|| {
        err(&req.id, "bad_params", "action must be draft or submit", None)
    })?;
    let resp = req.params.get("resp").cloned().unwrap_or(Value::Null);

    let outcome = workflow::save_self_assessment(conn, &ctx, &instance_id, action, &resp)
        .map_err(|e| core_err(req, e))?;

    if !outcome.incomplete.is_empty() {
        let details = json!({
            "incomplete": outcome.incomplete,
            "firstIncompleteSection": outcome.first_incomplete_section,
        });
        return Err(err(
            &req.id,
            "validation_incomplete",
            "required responses are missing",
            Some(details),
        ));
    }

    let open = workflow::open_self_assessment(
        conn,
        &ctx,
        &outcome.instance.enrollment_id,
        &outcome.instance.activity_ref,
    )
    .map_err(|e| core_err(req, e))?;
    let mut body = open_body(&open);
    if let Some(map) = body.as_object_mut() {
        map.insert("submitted".to_string(), json!(outcome.submitted));
    }
    Ok(ok(&req.id, body))
}

fn self_rows(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let ctx = request_context(conn, req)?;
    let instance_id = required_str(req, "instanceId")?;

    let instance = answers::load_instance(conn, &instance_id)
        .map_err(|e| core_err(req, e))?
        .ok_or_else(|| err(&req.id, "not_found", "assessment instance not found", None))?;
    workflow::authorize_enrollment(conn, &ctx, &instance.enrollment_id)
        .map_err(|e| core_err(req, e))?;

    let rows = answers::load_response_rows(conn, &instance_id).map_err(|e| core_err(req, e))?;
    let out: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "sectionKey": row.section_key,
                "itemKey": row.item_key,
                "value": row.value.to_json(),
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
