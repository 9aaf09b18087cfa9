use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::answers::AnswerValue;
use crate::errors::CoreError;

pub const LIKERT_DEFAULT: [&str; 5] = ["0", "1", "2", "3", "4"];
pub const SCALE_DEFAULT: [&str; 11] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10"];

#[derive(Debug, Clone, PartialEq)]
pub enum QuestionType {
    Likert {
        values: Vec<String>,
        anchors: BTreeMap<String, String>,
    },
    Scale {
        values: Vec<String>,
        anchors: BTreeMap<String, String>,
    },
    Text,
    Number,
    SingleSelect {
        options: Vec<String>,
    },
    MultiSelect {
        options: Vec<String>,
    },
}

impl QuestionType {
    pub fn is_multi(&self) -> bool {
        matches!(self, QuestionType::MultiSelect { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    pub key: String,
    pub prompt: String,
    pub required: bool,
    pub qtype: QuestionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    Likert,
    Scale,
}

impl SectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionType::Likert => "likert",
            SectionType::Scale => "scale",
        }
    }

    fn default_values(self) -> Vec<String> {
        match self {
            SectionType::Likert => LIKERT_DEFAULT.iter().map(|s| s.to_string()).collect(),
            SectionType::Scale => SCALE_DEFAULT.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A titled group of items on the self-assessment surface. Retrospective
/// sections render twice on the post phase (read-only "before", editable
/// "now").
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub key: String,
    pub title: String,
    pub stype: SectionType,
    pub retrospective: bool,
    pub scale_labels: Option<String>,
    pub items: Vec<Question>,
}

/// Parsed instrument schema. Holds whatever the stored JSON declares; a
/// malformed document parses to an empty definition rather than failing the
/// page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentDef {
    pub questions: Vec<Question>,
    pub sections: Vec<Section>,
    pub scale_labels: BTreeMap<String, Vec<String>>,
    pub instructions: Option<String>,
    pub styles: Option<String>,
}

impl InstrumentDef {
    pub fn parse(raw: &Value) -> InstrumentDef {
        let Some(obj) = raw.as_object() else {
            return InstrumentDef::default();
        };

        let mut def = InstrumentDef {
            instructions: nonempty_str(obj.get("instructions")),
            styles: nonempty_str(obj.get("styles")),
            ..InstrumentDef::default()
        };

        if let Some(labels) = obj.get("scaleLabels").and_then(Value::as_object) {
            for (name, set) in labels {
                if let Some(arr) = set.as_array() {
                    let vals: Vec<String> = arr.iter().filter_map(scalar_string).collect();
                    if !vals.is_empty() {
                        def.scale_labels.insert(name.clone(), vals);
                    }
                }
            }
        }

        if let Some(questions) = obj.get("questions").and_then(Value::as_array) {
            for q in questions {
                if let Some(parsed) = parse_question(q, None) {
                    def.questions.push(parsed);
                }
            }
        }

        if let Some(sections) = obj.get("sections").and_then(Value::as_array) {
            for s in sections {
                if let Some(parsed) = parse_section(s) {
                    def.sections.push(parsed);
                }
            }
        }

        def
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty() && self.sections.is_empty()
    }

    pub fn question(&self, key: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.key == key)
    }

    pub fn section(&self, key: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.key == key)
    }

    pub fn labels_for(&self, section: &Section) -> Option<&Vec<String>> {
        section
            .scale_labels
            .as_deref()
            .and_then(|name| self.scale_labels.get(name))
    }
}

fn nonempty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Allowed values come in two declared shapes: a native list, or a single
/// comma-delimited string. Anything else (or an empty result) falls back to
/// the supplied default.
fn parse_values(raw: Option<&Value>, default: Vec<String>) -> Vec<String> {
    let parsed: Vec<String> = match raw {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_string).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    if parsed.is_empty() {
        default
    } else {
        parsed
    }
}

fn parse_anchors(raw: Option<&Value>) -> BTreeMap<String, String> {
    let mut anchors = BTreeMap::new();
    if let Some(obj) = raw.and_then(Value::as_object) {
        for (k, v) in obj {
            if let Some(label) = scalar_string(v) {
                anchors.insert(k.clone(), label);
            }
        }
    }
    anchors
}

fn parse_question(raw: &Value, section_type: Option<SectionType>) -> Option<Question> {
    let obj = raw.as_object()?;
    let key = nonempty_str(obj.get("key")).or_else(|| nonempty_str(obj.get("id")))?;
    let prompt = nonempty_str(obj.get("prompt"))
        .or_else(|| nonempty_str(obj.get("label")))
        .unwrap_or_default();
    let required = obj.get("required").and_then(Value::as_bool).unwrap_or(false);

    let declared = nonempty_str(obj.get("type"));
    let type_name = declared.as_deref().unwrap_or(match section_type {
        Some(SectionType::Likert) => "likert",
        Some(SectionType::Scale) => "scale",
        None => "text",
    });

    let qtype = match type_name {
        "likert" => QuestionType::Likert {
            values: parse_values(obj.get("values"), SectionType::Likert.default_values()),
            anchors: parse_anchors(obj.get("anchors")),
        },
        "scale" => QuestionType::Scale {
            values: parse_values(obj.get("values"), SectionType::Scale.default_values()),
            anchors: parse_anchors(obj.get("anchors")),
        },
        "number" => QuestionType::Number,
        "single_select" | "select" => QuestionType::SingleSelect {
            options: parse_values(obj.get("options"), Vec::new()),
        },
        "multi_select" | "checkboxes" => QuestionType::MultiSelect {
            options: parse_values(obj.get("options"), Vec::new()),
        },
        _ => QuestionType::Text,
    };

    Some(Question {
        key,
        prompt,
        required,
        qtype,
    })
}

fn parse_section(raw: &Value) -> Option<Section> {
    let obj = raw.as_object()?;
    let key = nonempty_str(obj.get("key")).or_else(|| nonempty_str(obj.get("id")))?;
    let title = nonempty_str(obj.get("title"))
        .or_else(|| nonempty_str(obj.get("label")))
        .unwrap_or_default();
    let stype = match nonempty_str(obj.get("type")).as_deref() {
        Some("scale") => SectionType::Scale,
        _ => SectionType::Likert,
    };
    let retrospective = obj
        .get("retrospective")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let scale_labels = nonempty_str(obj.get("scaleLabels"));

    let mut items = Vec::new();
    if let Some(raw_items) = obj.get("items").and_then(Value::as_array) {
        for item in raw_items {
            if let Some(parsed) = parse_question(item, Some(stype)) {
                items.push(parsed);
            }
        }
    }

    Some(Section {
        key,
        title,
        stype,
        retrospective,
        scale_labels,
        items,
    })
}

/// Whether a stored value is one the question's controls could have produced.
/// Free-entry types accept any non-empty value; constrained types check the
/// allowed set, except that an empty declared option list places no
/// constraint.
pub fn value_matches(question: &Question, value: &AnswerValue) -> bool {
    if value.is_empty() {
        return false;
    }
    match &question.qtype {
        QuestionType::Text => true,
        QuestionType::Number => match value.as_scalar() {
            Some(s) => s.trim().parse::<f64>().is_ok(),
            None => false,
        },
        QuestionType::Likert { values, .. } | QuestionType::Scale { values, .. } => {
            match value.as_scalar() {
                Some(s) => values.iter().any(|v| v == s),
                None => false,
            }
        }
        QuestionType::SingleSelect { options } => match value.as_scalar() {
            Some(s) => options.is_empty() || options.iter().any(|o| o == s),
            None => false,
        },
        QuestionType::MultiSelect { options } => match value {
            AnswerValue::Many(vs) => {
                !vs.is_empty()
                    && (options.is_empty() || vs.iter().all(|v| options.iter().any(|o| o == v)))
            }
            AnswerValue::One(s) => options.is_empty() || options.iter().any(|o| o == s),
        },
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentRecord {
    pub id: String,
    pub name: String,
    pub category: String,
    pub instrument_type: String,
    pub version: i64,
    pub effective_from: Option<String>,
    pub effective_to: Option<String>,
    pub schema_sha256: String,
    pub def: InstrumentDef,
}

pub fn schema_fingerprint(schema: &Value) -> String {
    let canonical = schema.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstrumentRecord> {
    let schema_raw: String = row.get(8)?;
    let schema = serde_json::from_str::<Value>(&schema_raw).unwrap_or(Value::Null);
    Ok(InstrumentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        instrument_type: row.get(3)?,
        version: row.get(4)?,
        effective_from: row.get(5)?,
        effective_to: row.get(6)?,
        schema_sha256: row.get(7)?,
        def: InstrumentDef::parse(&schema),
    })
}

const RECORD_COLS: &str = "id, name, category, instrument_type, version, \
     effective_from, effective_to, schema_sha256, schema_json";

pub fn load_instrument(
    conn: &Connection,
    id: &str,
) -> Result<Option<InstrumentRecord>, CoreError> {
    let sql = format!("SELECT {} FROM instruments WHERE id = ?", RECORD_COLS);
    conn.query_row(&sql, [id], record_from_row)
        .optional()
        .map_err(CoreError::db)
}

pub fn list_instruments(
    conn: &Connection,
    category: Option<&str>,
) -> Result<Vec<InstrumentRecord>, CoreError> {
    let sql = format!(
        "SELECT {} FROM instruments
         WHERE (?1 IS NULL OR category = ?1)
         ORDER BY instrument_type, version DESC",
        RECORD_COLS
    );
    let mut stmt = conn.prepare(&sql).map_err(CoreError::db)?;
    stmt.query_map([category], record_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CoreError::db)
}

#[derive(Debug, Clone)]
pub struct DefinedInstrument {
    pub id: String,
    pub version: i64,
    pub schema_sha256: String,
    pub reused: bool,
}

/// Register an instrument schema. Instruments are immutable once stored:
/// re-defining with an identical schema returns the existing row, while a
/// changed schema lands as a new version of the same type.
pub fn define_instrument(
    conn: &Connection,
    name: &str,
    category: &str,
    instrument_type: &str,
    effective_from: Option<&str>,
    effective_to: Option<&str>,
    schema: &Value,
) -> Result<DefinedInstrument, CoreError> {
    let fingerprint = schema_fingerprint(schema);

    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT id, version FROM instruments
             WHERE instrument_type = ? AND schema_sha256 = ?
             ORDER BY version DESC LIMIT 1",
            (instrument_type, &fingerprint),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(CoreError::db)?;
    if let Some((id, version)) = existing {
        return Ok(DefinedInstrument {
            id,
            version,
            schema_sha256: fingerprint,
            reused: true,
        });
    }

    let next_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM instruments WHERE instrument_type = ?",
            [instrument_type],
            |r| r.get(0),
        )
        .map_err(CoreError::db)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO instruments(
           id, name, category, instrument_type, version,
           effective_from, effective_to, schema_sha256, schema_json, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            name,
            category,
            instrument_type,
            next_version,
            effective_from,
            effective_to,
            &fingerprint,
            schema.to_string(),
            crate::answers::now_utc(),
        ),
    )
    .map_err(|e| CoreError::new("db_insert_failed", e.to_string()))?;

    Ok(DefinedInstrument {
        id,
        version: next_version,
        schema_sha256: fingerprint,
        reused: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_schema_parses_to_empty_definition() {
        assert!(InstrumentDef::parse(&json!(null)).is_empty());
        assert!(InstrumentDef::parse(&json!([1, 2, 3])).is_empty());
        assert!(InstrumentDef::parse(&json!("text")).is_empty());
        assert!(InstrumentDef::parse(&json!({"questions": "oops"})).is_empty());
    }

    #[test]
    fn question_without_key_is_dropped() {
        let def = InstrumentDef::parse(&json!({
            "questions": [
                {"prompt": "no key"},
                {"key": "q1", "prompt": "kept", "type": "text"},
            ]
        }));
        assert_eq!(def.questions.len(), 1);
        assert_eq!(def.questions[0].key, "q1");
    }

    #[test]
    fn likert_values_default_when_absent() {
        let def = InstrumentDef::parse(&json!({
            "questions": [{"key": "q1", "type": "likert"}]
        }));
        match &def.questions[0].qtype {
            QuestionType::Likert { values, .. } => {
                assert_eq!(values, &["0", "1", "2", "3", "4"]);
            }
            other => panic!("expected likert, got {:?}", other),
        }
    }

    #[test]
    fn scale_values_default_to_eleven_points() {
        let def = InstrumentDef::parse(&json!({
            "questions": [{"key": "q1", "type": "scale"}]
        }));
        match &def.questions[0].qtype {
            QuestionType::Scale { values, .. } => {
                assert_eq!(values.len(), 11);
                assert_eq!(values[10], "10");
            }
            other => panic!("expected scale, got {:?}", other),
        }
    }

    #[test]
    fn values_accept_list_or_comma_string() {
        let def = InstrumentDef::parse(&json!({
            "questions": [
                {"key": "a", "type": "likert", "values": ["1", "2", "3"]},
                {"key": "b", "type": "likert", "values": "1, 2 ,3"},
                {"key": "c", "type": "likert", "values": [1, 2]},
            ]
        }));
        for q in &def.questions[..2] {
            match &q.qtype {
                QuestionType::Likert { values, .. } => assert_eq!(values, &["1", "2", "3"]),
                other => panic!("expected likert, got {:?}", other),
            }
        }
        match &def.questions[2].qtype {
            QuestionType::Likert { values, .. } => assert_eq!(values, &["1", "2"]),
            other => panic!("expected likert, got {:?}", other),
        }
    }

    #[test]
    fn section_items_inherit_section_type() {
        let def = InstrumentDef::parse(&json!({
            "sections": [{
                "key": "s1",
                "title": "Confidence",
                "type": "scale",
                "retrospective": true,
                "scaleLabels": "confidence",
                "items": [{"key": "i1", "prompt": "How sure?"}]
            }],
            "scaleLabels": {"confidence": ["low", "high"]}
        }));
        let section = &def.sections[0];
        assert_eq!(section.stype, SectionType::Scale);
        assert!(section.retrospective);
        assert!(matches!(
            section.items[0].qtype,
            QuestionType::Scale { .. }
        ));
        assert_eq!(
            def.labels_for(section),
            Some(&vec!["low".to_string(), "high".to_string()])
        );
    }

    #[test]
    fn value_matches_enforces_allowed_sets() {
        let likert = Question {
            key: "q".into(),
            prompt: String::new(),
            required: true,
            qtype: QuestionType::Likert {
                values: vec!["0".into(), "1".into(), "2".into()],
                anchors: BTreeMap::new(),
            },
        };
        assert!(value_matches(&likert, &AnswerValue::One("1".into())));
        assert!(!value_matches(&likert, &AnswerValue::One("5".into())));
        assert!(!value_matches(&likert, &AnswerValue::One("".into())));

        let multi = Question {
            key: "m".into(),
            prompt: String::new(),
            required: false,
            qtype: QuestionType::MultiSelect {
                options: vec!["a".into(), "b".into()],
            },
        };
        assert!(value_matches(
            &multi,
            &AnswerValue::Many(vec!["a".into(), "b".into()])
        ));
        assert!(!value_matches(
            &multi,
            &AnswerValue::Many(vec!["a".into(), "z".into()])
        ));

        let number = Question {
            key: "n".into(),
            prompt: String::new(),
            required: false,
            qtype: QuestionType::Number,
        };
        assert!(value_matches(&number, &AnswerValue::One("3.5".into())));
        assert!(!value_matches(&number, &AnswerValue::One("abc".into())));
    }

    #[test]
    fn fingerprint_is_stable_for_identical_schemas() {
        let a = json!({"questions": [{"key": "q1", "type": "likert"}]});
        let b = json!({"questions": [{"key": "q1", "type": "likert"}]});
        assert_eq!(schema_fingerprint(&a), schema_fingerprint(&b));
        let c = json!({"questions": [{"key": "q2", "type": "likert"}]});
        assert_ne!(schema_fingerprint(&a), schema_fingerprint(&c));
    }
}
