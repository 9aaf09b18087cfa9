use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::answers::now_utc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{core_err, db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, Child, AGE_BANDS};
use crate::workflow::UserRole;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "users.create" => users_create(state, req),
        "classrooms.create" => classrooms_create(state, req),
        "classrooms.list" => classrooms_list(state, req),
        "roster.addChild" => roster_add_child(state, req),
        "roster.updateChild" => roster_update_child(state, req),
        "roster.withdrawChild" => roster_withdraw_child(state, req),
        "roster.list" => roster_list(state, req),
        "enrollments.create" => enrollments_create(state, req),
        "activities.define" => activities_define(state, req),
        "activities.list" => activities_list(state, req),
        _ => return None,
    };
    Some(resp.unwrap_or_else(|e| e))
}

fn users_create(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let display_name = required_str(req, "displayName")?;
    let role = required_str(req, "role")?;
    if UserRole::parse(&role).is_none() {
        return Err(err(
            &req.id,
            "bad_params",
            "role must be educator or manager",
            None,
        ));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, display_name, role) VALUES(?, ?, ?)",
        (&id, &display_name, &role),
    )
    .map_err(|e| err(&req.id, "db_insert_failed", e.to_string(), None))?;
    Ok(ok(&req.id, json!({ "userId": id })))
}

fn classrooms_create(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let track = optional_str(req, "track");
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classrooms(id, name, track) VALUES(?, ?, ?)",
        (&id, &name, &track),
    )
    .map_err(|e| err(&req.id, "db_insert_failed", e.to_string(), None))?;
    Ok(ok(&req.id, json!({ "classroomId": id })))
}

fn classrooms_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let mut stmt = conn
        .prepare("SELECT id, name, track FROM classrooms ORDER BY name")
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let rows: Result<Vec<Value>, rusqlite::Error> = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "track": row.get::<_, Option<String>>(2)?,
            }))
        })
        .and_then(|it| it.collect());
    let rows = rows.map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(ok(&req.id, json!({ "classrooms": rows })))
}

fn valid_age_band(band: &str) -> bool {
    AGE_BANDS.contains(&band)
}

fn child_json(child: &Child) -> Value {
    json!({
        "id": child.id,
        "classroomId": child.classroom_id,
        "lastName": child.last_name,
        "firstName": child.first_name,
        "displayName": child.display_name(),
        "displayCode": child.display_code,
        "birthDate": child.birth_date,
        "ageBand": child.age_band,
        "active": child.active,
    })
}

fn roster_add_child(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let classroom_id = required_str(req, "classroomId")?;
    let last_name = required_str(req, "lastName")?;
    let first_name = required_str(req, "firstName")?;
    let display_code = optional_str(req, "displayCode");
    let birth_date = optional_str(req, "birthDate");
    let age_band = optional_str(req, "ageBand").unwrap_or_else(|| "mixed".to_string());
    if !valid_age_band(&age_band) {
        return Err(err(
            &req.id,
            "bad_params",
            format!("unknown age band: {}", age_band),
            None,
        ));
    }
    require_row(conn, req, "classrooms", &classroom_id, "classroom not found")?;

    // New children sort after everyone already on the roster.
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM children WHERE classroom_id = ?",
            [&classroom_id],
            |row| row.get(0),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO children(id, classroom_id, last_name, first_name, display_code,
                              birth_date, age_band, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &id,
            &classroom_id,
            &last_name,
            &first_name,
            &display_code,
            &birth_date,
            &age_band,
            next_sort,
            now_utc(),
        ),
    )
    .map_err(|e| err(&req.id, "db_insert_failed", e.to_string(), None))?;
    Ok(ok(&req.id, json!({ "childId": id })))
}

fn roster_update_child(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let child_id = required_str(req, "childId")?;
    let mut child = roster::load_child(conn, &child_id)
        .map_err(|e| core_err(req, e))?
        .ok_or_else(|| err(&req.id, "not_found", "child not found", None))?;

    if let Some(v) = optional_str(req, "lastName") {
        child.last_name = v;
    }
    if let Some(v) = optional_str(req, "firstName") {
        child.first_name = v;
    }
    if let Some(v) = req.params.get("displayCode") {
        child.display_code = v.as_str().map(str::to_string).filter(|s| !s.is_empty());
    }
    if let Some(v) = req.params.get("birthDate") {
        child.birth_date = v.as_str().map(str::to_string).filter(|s| !s.is_empty());
    }
    if let Some(v) = optional_str(req, "ageBand") {
        if !valid_age_band(&v) {
            return Err(err(
                &req.id,
                "bad_params",
                format!("unknown age band: {}", v),
                None,
            ));
        }
        child.age_band = v;
    }
    if let Some(v) = req.params.get("active").and_then(|v| v.as_bool()) {
        child.active = v;
    }

    conn.execute(
        "UPDATE children SET last_name = ?, first_name = ?, display_code = ?, birth_date = ?,
                             age_band = ?, active = ?, updated_at = ?
         WHERE id = ?",
        (
            &child.last_name,
            &child.first_name,
            &child.display_code,
            &child.birth_date,
            &child.age_band,
            child.active as i64,
            now_utc(),
            &child_id,
        ),
    )
    .map_err(|e| err(&req.id, "db_insert_failed", e.to_string(), None))?;
    Ok(ok(&req.id, json!({ "child": child_json(&child) })))
}

fn roster_withdraw_child(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let child_id = required_str(req, "childId")?;
    let changed = conn
        .execute(
            "UPDATE children SET active = 0, updated_at = ? WHERE id = ?",
            (now_utc(), &child_id),
        )
        .map_err(|e| err(&req.id, "db_insert_failed", e.to_string(), None))?;
    if changed == 0 {
        return Err(err(&req.id, "not_found", "child not found", None));
    }
    Ok(ok(&req.id, json!({ "withdrawn": true })))
}

fn roster_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let classroom_id = required_str(req, "classroomId")?;
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let children = roster::load_children(conn, &classroom_id, include_inactive)
        .map_err(|e| core_err(req, e))?;
    let out: Vec<Value> = children.iter().map(child_json).collect();
    Ok(ok(&req.id, json!({ "children": out })))
}

fn enrollments_create(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let classroom_id = required_str(req, "classroomId")?;
    let owner_user_id = required_str(req, "ownerUserId")?;
    require_row(conn, req, "classrooms", &classroom_id, "classroom not found")?;
    require_row(conn, req, "users", &owner_user_id, "user not found")?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO enrollments(id, classroom_id, owner_user_id) VALUES(?, ?, ?)",
        (&id, &classroom_id, &owner_user_id),
    )
    .map_err(|e| err(&req.id, "db_insert_failed", e.to_string(), None))?;
    Ok(ok(&req.id, json!({ "enrollmentId": id })))
}

fn activities_define(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let activity_ref = required_str(req, "ref")?;
    let kind = required_str(req, "kind")?;
    let phase = required_str(req, "phase")?;
    if kind != "children" && kind != "educator" {
        return Err(err(
            &req.id,
            "bad_params",
            "kind must be children or educator",
            None,
        ));
    }
    if phase != "pre" && phase != "post" {
        return Err(err(&req.id, "bad_params", "phase must be pre or post", None));
    }
    let title = optional_str(req, "title");
    // Bindings may point at instruments defined later; resolution treats a
    // dangling id the same as no binding.
    let instrument_id = optional_str(req, "instrumentId");

    conn.execute(
        "INSERT INTO activities(ref, kind, phase, instrument_id, title) VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(ref) DO UPDATE SET
            kind = excluded.kind,
            phase = excluded.phase,
            instrument_id = excluded.instrument_id,
            title = excluded.title",
        (&activity_ref, &kind, &phase, &instrument_id, &title),
    )
    .map_err(|e| err(&req.id, "db_insert_failed", e.to_string(), None))?;
    Ok(ok(&req.id, json!({ "ref": activity_ref })))
}

fn activities_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let mut stmt = conn
        .prepare("SELECT ref, kind, phase, instrument_id, title FROM activities ORDER BY ref")
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let rows: Result<Vec<Value>, rusqlite::Error> = stmt
        .query_map([], |row| {
            Ok(json!({
                "ref": row.get::<_, String>(0)?,
                "kind": row.get::<_, String>(1)?,
                "phase": row.get::<_, String>(2)?,
                "instrumentId": row.get::<_, Option<String>>(3)?,
                "title": row.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect());
    let rows = rows.map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(ok(&req.id, json!({ "activities": rows })))
}

fn require_row(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    missing: &str,
) -> Result<(), Value> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", table);
    let count: i64 = conn
        .query_row(&sql, [id], |row| row.get(0))
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if count == 0 {
        return Err(err(&req.id, "not_found", missing, None));
    }
    Ok(())
}
