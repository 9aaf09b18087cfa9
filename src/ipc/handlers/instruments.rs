use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use tracing::info;

use crate::instrument::{self, InstrumentRecord};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{core_err, db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::roster::AGE_BANDS;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "instruments.define" => instruments_define(state, req),
        "instruments.list" => instruments_list(state, req),
        "instruments.get" => instruments_get(state, req),
        _ => return None,
    };
    Some(resp.unwrap_or_else(|e| e))
}

fn record_json(rec: &InstrumentRecord) -> Value {
    json!({
        "id": rec.id,
        "name": rec.name,
        "category": rec.category,
        "instrumentType": rec.instrument_type,
        "version": rec.version,
        "effectiveFrom": rec.effective_from,
        "effectiveTo": rec.effective_to,
        "schemaSha256": rec.schema_sha256,
    })
}

fn instruments_define(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let category = required_str(req, "category")?;
    let age_band = optional_str(req, "ageBand");
    if let Some(band) = &age_band {
        if !AGE_BANDS.contains(&band.as_str()) {
            return Err(err(
                &req.id,
                "bad_params",
                format!("unknown age band: {}", band),
                None,
            ));
        }
    }
    // The type key drives resolution; callers can pin it explicitly, otherwise
    // it is derived from category and band.
    let instrument_type = optional_str(req, "instrumentType").unwrap_or_else(|| match &age_band {
        Some(band) => format!("{}_{}", category, band),
        None => category.clone(),
    });
    let schema = match req.params.get("schema") {
        Some(v) if !v.is_null() => v.clone(),
        _ => return Err(err(&req.id, "bad_params", "missing params.schema", None)),
    };
    let effective_from = optional_str(req, "effectiveFrom");
    let effective_to = optional_str(req, "effectiveTo");

    let defined = instrument::define_instrument(
        conn,
        &name,
        &category,
        &instrument_type,
        effective_from.as_deref(),
        effective_to.as_deref(),
        &schema,
    )
    .map_err(|e| core_err(req, e))?;

    if !defined.reused {
        info!(
            instrument_type = %instrument_type,
            version = defined.version,
            "instrument version registered"
        );
    }
    Ok(ok(
        &req.id,
        json!({
            "instrumentId": defined.id,
            "instrumentType": instrument_type,
            "version": defined.version,
            "schemaSha256": defined.schema_sha256,
            "reused": defined.reused,
        }),
    ))
}

fn instruments_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let category = optional_str(req, "category");
    let records = instrument::list_instruments(conn, category.as_deref())
        .map_err(|e| core_err(req, e))?;
    let out: Vec<Value> = records.iter().map(record_json).collect();
    Ok(ok(&req.id, json!({ "instruments": out })))
}

fn instruments_get(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let instrument_id = required_str(req, "instrumentId")?;
    let record = instrument::load_instrument(conn, &instrument_id)
        .map_err(|e| core_err(req, e))?
        .ok_or_else(|| err(&req.id, "not_found", "instrument not found", None))?;
    let schema_raw: Option<String> = conn
        .query_row(
            "SELECT schema_json FROM instruments WHERE id = ?",
            [&instrument_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let schema = schema_raw
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .unwrap_or(Value::Null);

    let mut body = record_json(&record);
    if let Some(map) = body.as_object_mut() {
        map.insert("schema".to_string(), schema);
    }
    Ok(ok(&req.id, json!({ "instrument": body })))
}
