use crate::answers::{AnswerRow, Instance, Phase, ResponseRow, RowStatus};
use crate::html::{attr, escape};
use crate::instrument::{InstrumentRecord, Question, QuestionType};
use crate::roster::Child;
use crate::workflow::RetroMap;

/// Distinguishes "no value recorded" from a cell that has not loaded.
const EMPTY_MARK: &str = "&mdash;";
const DOT_MARK: &str = "&#9679;";

fn submitted_line(instance: &Instance, out: &mut String) {
    if let Some(at) = &instance.submitted_at {
        out.push_str(&format!(
            "<p class=\"assess-submitted-at\">Submitted {}</p>\n",
            escape(at)
        ));
    }
}

fn single_likert(record: &InstrumentRecord) -> Option<&Question> {
    match record.def.questions.as_slice() {
        [q] if matches!(q.qtype, QuestionType::Likert { .. }) => Some(q),
        _ => None,
    }
}

struct SummaryRow<'a> {
    name: String,
    row: &'a AnswerRow,
    stale: bool,
}

/// Rows in roster order, names joined from the roster, `not_in_classroom`
/// rows dropped. Rows whose child is no longer known at all keep the raw id
/// as the display name.
fn summary_rows<'a>(children: &[Child], rows: &'a [AnswerRow]) -> Vec<SummaryRow<'a>> {
    let mut out = Vec::new();
    let mut seen = Vec::new();
    for child in children {
        if let Some(row) = rows.iter().find(|r| r.child_id == child.id) {
            if row.status == RowStatus::NotInClassroom {
                continue;
            }
            seen.push(child.id.clone());
            out.push(SummaryRow {
                name: child.display_name(),
                row,
                stale: row.status == RowStatus::StaleAtSubmit,
            });
        }
    }
    for row in rows {
        if row.status == RowStatus::NotInClassroom || seen.contains(&row.child_id) {
            continue;
        }
        out.push(SummaryRow {
            name: row.child_id.clone(),
            row,
            stale: row.status == RowStatus::StaleAtSubmit,
        });
    }
    out
}

fn name_cell(entry: &SummaryRow<'_>, out: &mut String) {
    out.push_str("<td class=\"assess-name\">");
    out.push_str(&escape(&entry.name));
    if entry.stale {
        out.push_str(" <span class=\"assess-stale-tag\">left classroom</span>");
    }
    out.push_str("</td>");
}

fn skip_text(row: &AnswerRow) -> String {
    match row.skip_reason.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(reason) => format!("Skipped: {}", escape(reason)),
        None => "Skipped".to_string(),
    }
}

/// Transposed matrix for the one-question Likert case: children as rows,
/// allowed values as columns, one dot in the recorded column, a single
/// spanning cell for skipped children.
fn render_transposed(
    question: &Question,
    entries: &[SummaryRow<'_>],
    out: &mut String,
) {
    let values = match &question.qtype {
        QuestionType::Likert { values, .. } => values,
        _ => return,
    };
    out.push_str("<table class=\"assess-summary assess-matrix\"><thead><tr><th>");
    out.push_str(&escape(&question.prompt));
    out.push_str("</th>");
    for value in values {
        out.push_str(&format!("<th>{}</th>", escape(value)));
    }
    out.push_str("</tr></thead>\n<tbody>\n");

    for entry in entries {
        out.push_str(&format!(
            "<tr data-child=\"{}\">",
            attr(&entry.row.child_id)
        ));
        name_cell(entry, out);
        if entry.row.status == RowStatus::Skipped {
            out.push_str(&format!(
                "<td class=\"assess-skip-cell\" colspan=\"{}\">{}</td>",
                values.len(),
                skip_text(entry.row)
            ));
        } else {
            let recorded = entry
                .row
                .answers
                .get(&question.key)
                .and_then(|v| v.as_scalar().map(str::to_string));
            for value in values {
                if recorded.as_deref() == Some(value.as_str()) {
                    out.push_str(&format!(
                        "<td class=\"assess-mark\">{}</td>",
                        DOT_MARK
                    ));
                } else {
                    out.push_str("<td></td>");
                }
            }
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</tbody></table>\n");
}

fn render_general(
    record: &InstrumentRecord,
    entries: &[SummaryRow<'_>],
    out: &mut String,
) {
    let questions = &record.def.questions;
    out.push_str("<table class=\"assess-summary\"><thead><tr><th>Child</th>");
    for q in questions {
        out.push_str(&format!("<th>{}</th>", escape(&q.prompt)));
    }
    out.push_str("</tr></thead>\n<tbody>\n");
    for entry in entries {
        out.push_str(&format!(
            "<tr data-child=\"{}\">",
            attr(&entry.row.child_id)
        ));
        name_cell(entry, out);
        if entry.row.status == RowStatus::Skipped {
            out.push_str(&format!(
                "<td class=\"assess-skip-cell\" colspan=\"{}\">{}</td>",
                questions.len(),
                skip_text(entry.row)
            ));
        } else {
            for q in questions {
                match entry.row.answers.get(&q.key) {
                    Some(v) if !v.is_empty() => {
                        out.push_str(&format!("<td>{}</td>", escape(&v.display())));
                    }
                    _ => out.push_str(&format!("<td class=\"assess-none\">{}</td>", EMPTY_MARK)),
                }
            }
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</tbody></table>\n");
}

pub fn render_children_summary(
    record: &InstrumentRecord,
    children: &[Child],
    rows: &[AnswerRow],
    instance: &Instance,
) -> String {
    let mut out = String::new();
    submitted_line(instance, &mut out);

    let entries = summary_rows(children, rows);
    if entries.is_empty() {
        out.push_str("<p class=\"assess-empty\">No answers were recorded.</p>");
        return out;
    }

    match single_likert(record) {
        Some(q) => render_transposed(q, &entries, &mut out),
        None => render_general(record, &entries, &mut out),
    }
    out
}

pub fn render_self_summary(
    record: &InstrumentRecord,
    rows: &[ResponseRow],
    retro: &RetroMap,
    instance: &Instance,
) -> String {
    let mut out = String::new();
    submitted_line(instance, &mut out);

    if record.def.sections.is_empty() {
        out.push_str("<p class=\"assess-empty\">No answers were recorded.</p>");
        return out;
    }

    for section in &record.def.sections {
        let dual = section.retrospective && instance.phase == Phase::Post;
        out.push_str(&format!(
            "<h3 class=\"assess-section-title\">{}</h3>\n",
            escape(&section.title)
        ));
        out.push_str("<table class=\"assess-summary\"><thead><tr><th></th>");
        if dual {
            out.push_str("<th>Before</th><th>Now</th>");
        } else {
            out.push_str("<th>Answer</th>");
        }
        out.push_str("</tr></thead>\n<tbody>\n");
        for item in &section.items {
            out.push_str("<tr><td class=\"assess-prompt\">");
            out.push_str(&escape(&item.prompt));
            out.push_str("</td>");
            if dual {
                let pair = retro
                    .get(&(section.key.clone(), item.key.clone()))
                    .cloned()
                    .unwrap_or_default();
                for value in [&pair.before, &pair.now] {
                    match value {
                        Some(v) if !v.is_empty() => {
                            out.push_str(&format!("<td>{}</td>", escape(&v.display())));
                        }
                        _ => out
                            .push_str(&format!("<td class=\"assess-none\">{}</td>", EMPTY_MARK)),
                    }
                }
            } else {
                let stored = rows
                    .iter()
                    .find(|r| r.section_key == section.key && r.item_key == item.key)
                    .map(|r| &r.value);
                match stored {
                    Some(v) if !v.is_empty() => {
                        out.push_str(&format!("<td>{}</td>", escape(&v.display())));
                    }
                    _ => out.push_str(&format!("<td class=\"assess-none\">{}</td>", EMPTY_MARK)),
                }
            }
            out.push_str("</tr>\n");
        }
        out.push_str("</tbody></table>\n");
    }
    out
}
