use rusqlite::{Connection, OptionalExtension};

use crate::errors::CoreError;
use crate::roster;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub instrument_id: String,
    pub version: i64,
}

/// Layered instrument lookup. Priority: the activity's explicit binding,
/// then a currently-effective `<category>_<band>` type match, then the same
/// for the band's fallback, then the newest instrument of the category by
/// effective date. A dangling explicit reference falls through instead of
/// blocking the chain. `None` means the caller renders a blocked state, not
/// an error.
pub fn resolve(
    conn: &Connection,
    category: &str,
    age_band: Option<&str>,
    explicit_id: Option<&str>,
    on_date: &str,
) -> Result<Option<Resolved>, CoreError> {
    if let Some(id) = explicit_id {
        if let Some(found) = by_id(conn, id)? {
            return Ok(Some(found));
        }
    }

    if let Some(band) = age_band {
        let itype = format!("{}_{}", category, band);
        if let Some(found) = effective_type_match(conn, &itype, on_date)? {
            return Ok(Some(found));
        }
        if let Some(fb) = roster::fallback_band(band) {
            let itype = format!("{}_{}", category, fb);
            if let Some(found) = effective_type_match(conn, &itype, on_date)? {
                return Ok(Some(found));
            }
        }
    }

    newest_in_category(conn, category)
}

fn by_id(conn: &Connection, id: &str) -> Result<Option<Resolved>, CoreError> {
    conn.query_row(
        "SELECT id, version FROM instruments WHERE id = ?",
        [id],
        |r| {
            Ok(Resolved {
                instrument_id: r.get(0)?,
                version: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(CoreError::db)
}

fn effective_type_match(
    conn: &Connection,
    instrument_type: &str,
    on_date: &str,
) -> Result<Option<Resolved>, CoreError> {
    conn.query_row(
        "SELECT id, version FROM instruments
         WHERE instrument_type = ?1
           AND (effective_from IS NULL OR effective_from <= ?2)
           AND (effective_to IS NULL OR effective_to >= ?2)
         ORDER BY version DESC LIMIT 1",
        (instrument_type, on_date),
        |r| {
            Ok(Resolved {
                instrument_id: r.get(0)?,
                version: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(CoreError::db)
}

fn newest_in_category(conn: &Connection, category: &str) -> Result<Option<Resolved>, CoreError> {
    conn.query_row(
        "SELECT id, version FROM instruments
         WHERE category = ?
         ORDER BY (effective_from IS NULL), effective_from DESC, version DESC
         LIMIT 1",
        [category],
        |r| {
            Ok(Resolved {
                instrument_id: r.get(0)?,
                version: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(CoreError::db)
}
