use std::collections::BTreeMap;

use serde::Serialize;

use crate::answers::{AnswerRow, AnswerValue, Instance, Phase, ResponseRow, RowStatus};
use crate::html::{attr, escape};
use crate::instrument::{InstrumentDef, InstrumentRecord, Question, QuestionType, Section};
use crate::roster::Child;
use crate::workflow::{RetroMap, AGE_GROUP_KEY, INSTRUMENT_KEY, SKIP_KEY, SKIP_REASON_KEY};

/// What the UI shell needs to drive stepping and submit-time enforcement.
/// Required controls carry `data-required="1"` in the markup; the shell
/// turns that into live `required` attributes for a final submit and leaves
/// them off for drafts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContract {
    pub steps: Vec<ContractStep>,
    pub draft_bypasses_validation: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractStep {
    pub step: usize,
    pub section_key: String,
    pub required_controls: Vec<String>,
}

pub fn child_control_name(child_id: &str, question_key: &str, multi: bool) -> String {
    if multi {
        format!("answers[{}][{}][]", child_id, question_key)
    } else {
        format!("answers[{}][{}]", child_id, question_key)
    }
}

pub fn self_control_name(section_key: &str, item_key: &str, retrospective: bool) -> String {
    if retrospective {
        format!("resp[{}][{}][now]", section_key, item_key)
    } else {
        format!("resp[{}][{}]", section_key, item_key)
    }
}

pub fn children_contract(def: &InstrumentDef, children: &[Child]) -> ClientContract {
    let mut required_controls = Vec::new();
    for child in children {
        for q in def.questions.iter().filter(|q| q.required) {
            required_controls.push(child_control_name(&child.id, &q.key, q.qtype.is_multi()));
        }
    }
    ClientContract {
        steps: vec![ContractStep {
            step: 1,
            section_key: String::new(),
            required_controls,
        }],
        draft_bypasses_validation: true,
    }
}

pub fn self_contract(def: &InstrumentDef, phase: Phase) -> ClientContract {
    let steps = def
        .sections
        .iter()
        .enumerate()
        .map(|(i, section)| {
            let dual = section.retrospective && phase == Phase::Post;
            ContractStep {
                step: i + 1,
                section_key: section.key.clone(),
                required_controls: section
                    .items
                    .iter()
                    .filter(|q| q.required)
                    .map(|q| self_control_name(&section.key, &q.key, dual))
                    .collect(),
            }
        })
        .collect();
    ClientContract {
        steps,
        draft_bypasses_validation: true,
    }
}

pub fn render_blocked(reason: &str) -> String {
    format!(
        "<div class=\"assess-blocked\"><p>{}</p></div>",
        escape(reason)
    )
}

fn head(def: &InstrumentDef, out: &mut String) {
    if let Some(styles) = &def.styles {
        // Schema styles are admin-authored CSS, passed through as-is.
        out.push_str("<style>");
        out.push_str(styles);
        out.push_str("</style>\n");
    }
    if let Some(instructions) = &def.instructions {
        out.push_str("<div class=\"assess-instructions\"><p>");
        out.push_str(&escape(instructions));
        out.push_str("</p></div>\n");
    }
}

fn choice_group(
    out: &mut String,
    name: &str,
    values: &[String],
    anchors: &BTreeMap<String, String>,
    selected: Option<&AnswerValue>,
    required: bool,
    disabled: bool,
) {
    out.push_str("<span class=\"assess-choices\">");
    for value in values {
        let checked = selected.map(|s| s.selects(value)).unwrap_or(false);
        out.push_str("<label class=\"assess-choice\"");
        if let Some(anchor) = anchors.get(value) {
            out.push_str(&format!(" title=\"{}\"", attr(anchor)));
        }
        out.push('>');
        out.push_str("<input type=\"radio\"");
        if !disabled {
            out.push_str(&format!(" name=\"{}\"", attr(name)));
        }
        out.push_str(&format!(" value=\"{}\"", attr(value)));
        if checked {
            out.push_str(" checked");
        }
        if required && !disabled {
            out.push_str(" data-required=\"1\"");
        }
        if disabled {
            out.push_str(" disabled");
        }
        out.push_str("><span>");
        out.push_str(&escape(value));
        out.push_str("</span></label>");
    }
    out.push_str("</span>");
}

fn text_input(out: &mut String, name: &str, kind: &str, current: Option<&AnswerValue>, required: bool) {
    out.push_str(&format!(
        "<input type=\"{}\" name=\"{}\"",
        kind,
        attr(name)
    ));
    if let Some(AnswerValue::One(v)) = current {
        out.push_str(&format!(" value=\"{}\"", attr(v)));
    }
    if required {
        out.push_str(" data-required=\"1\"");
    }
    out.push('>');
}

fn select_input(
    out: &mut String,
    name: &str,
    options: &[String],
    current: Option<&AnswerValue>,
    required: bool,
) {
    out.push_str(&format!("<select name=\"{}\"", attr(name)));
    if required {
        out.push_str(" data-required=\"1\"");
    }
    out.push_str("><option value=\"\"></option>");
    for opt in options {
        let sel = current.map(|c| c.selects(opt)).unwrap_or(false);
        out.push_str(&format!(
            "<option value=\"{}\"{}>{}</option>",
            attr(opt),
            if sel { " selected" } else { "" },
            escape(opt)
        ));
    }
    out.push_str("</select>");
}

fn checkbox_group(
    out: &mut String,
    name: &str,
    options: &[String],
    current: Option<&AnswerValue>,
    required: bool,
) {
    out.push_str("<span class=\"assess-checks\">");
    for opt in options {
        let checked = current.map(|c| c.selects(opt)).unwrap_or(false);
        out.push_str("<label class=\"assess-check\">");
        out.push_str(&format!(
            "<input type=\"checkbox\" name=\"{}\" value=\"{}\"",
            attr(name),
            attr(opt)
        ));
        if checked {
            out.push_str(" checked");
        }
        if required {
            out.push_str(" data-required=\"1\"");
        }
        out.push_str("><span>");
        out.push_str(&escape(opt));
        out.push_str("</span></label>");
    }
    out.push_str("</span>");
}

/// One control per (subject, question) pair, dispatched on the question's
/// typed variant.
fn question_control(out: &mut String, name: &str, q: &Question, current: Option<&AnswerValue>) {
    match &q.qtype {
        QuestionType::Likert { values, anchors } | QuestionType::Scale { values, anchors } => {
            choice_group(out, name, values, anchors, current, q.required, false);
        }
        QuestionType::Text => text_input(out, name, "text", current, q.required),
        QuestionType::Number => text_input(out, name, "number", current, q.required),
        QuestionType::SingleSelect { options } => {
            select_input(out, name, options, current, q.required);
        }
        QuestionType::MultiSelect { options } => {
            checkbox_group(out, name, options, current, q.required);
        }
    }
}

/// The children grid: one row per active roster child, one column per
/// question, plus per-child skip controls and hidden frozen-snapshot fields.
/// Empty roster and empty instrument are both renderable states.
pub fn render_children_form(
    record: &InstrumentRecord,
    children: &[Child],
    rows: &[AnswerRow],
    instance: &Instance,
) -> String {
    let def = &record.def;
    let mut out = String::new();
    head(def, &mut out);

    if children.is_empty() {
        out.push_str(
            "<p class=\"assess-empty\">No children are currently enrolled in this classroom.</p>",
        );
        return out;
    }
    if def.questions.is_empty() {
        out.push_str("<p class=\"assess-empty\">This instrument has no questions to display.</p>");
        return out;
    }

    out.push_str(&format!(
        "<form class=\"assess-form assess-children\" data-instance=\"{}\" data-phase=\"{}\">\n",
        attr(&instance.id),
        instance.phase.as_str()
    ));
    out.push_str("<table class=\"assess-grid\"><thead><tr><th>Child</th>");
    for q in &def.questions {
        out.push_str("<th");
        if q.required {
            out.push_str(" class=\"assess-required\"");
        }
        out.push('>');
        out.push_str(&escape(&q.prompt));
        out.push_str("</th>");
    }
    out.push_str("<th>Skip</th></tr></thead>\n<tbody>\n");

    for child in children {
        let row = rows.iter().find(|r| r.child_id == child.id);
        let skipped = row.map(|r| r.status == RowStatus::Skipped).unwrap_or(false);
        let frozen_band = row
            .and_then(|r| r.frozen_age_band.clone())
            .unwrap_or_else(|| child.age_band.clone());
        let frozen_instrument = row
            .and_then(|r| r.frozen_instrument_id.clone())
            .or_else(|| instance.instrument_id.clone())
            .unwrap_or_else(|| record.id.clone());

        out.push_str(&format!(
            "<tr class=\"assess-child{}\" data-child=\"{}\">",
            if skipped { " assess-skipped" } else { "" },
            attr(&child.id)
        ));
        out.push_str("<td class=\"assess-name\">");
        out.push_str(&escape(&child.display_name()));
        if let Some(code) = &child.display_code {
            out.push_str(&format!(
                " <span class=\"assess-code\">{}</span>",
                escape(code)
            ));
        }
        out.push_str(&format!(
            "<input type=\"hidden\" name=\"{}\" value=\"{}\">",
            attr(&child_control_name(&child.id, AGE_GROUP_KEY, false)),
            attr(&frozen_band)
        ));
        out.push_str(&format!(
            "<input type=\"hidden\" name=\"{}\" value=\"{}\">",
            attr(&child_control_name(&child.id, INSTRUMENT_KEY, false)),
            attr(&frozen_instrument)
        ));
        out.push_str("</td>");

        for q in &def.questions {
            let current = row.and_then(|r| r.answers.get(&q.key));
            out.push_str("<td class=\"assess-cell\">");
            let name = child_control_name(&child.id, &q.key, q.qtype.is_multi());
            question_control(&mut out, &name, q, current);
            out.push_str("</td>");
        }

        out.push_str("<td class=\"assess-skip\">");
        out.push_str(&format!(
            "<label><input type=\"checkbox\" name=\"{}\" value=\"1\"{}> Skip</label>",
            attr(&child_control_name(&child.id, SKIP_KEY, false)),
            if skipped { " checked" } else { "" }
        ));
        out.push_str(&format!(
            "<input type=\"text\" name=\"{}\" placeholder=\"Reason\"",
            attr(&child_control_name(&child.id, SKIP_REASON_KEY, false))
        ));
        if let Some(reason) = row.and_then(|r| r.skip_reason.as_deref()) {
            out.push_str(&format!(" value=\"{}\"", attr(reason)));
        }
        out.push_str("></td></tr>\n");
    }

    out.push_str("</tbody></table>\n");
    out.push_str(
        "<div class=\"assess-nav\">\
         <button type=\"submit\" data-action=\"draft\" formnovalidate>Save draft</button>\
         <button type=\"submit\" data-action=\"submit\">Submit</button>\
         </div>\n</form>\n",
    );
    out
}

fn scale_legend(def: &InstrumentDef, section: &Section, out: &mut String) {
    if let Some(labels) = def.labels_for(section) {
        out.push_str("<div class=\"assess-scale-legend\">");
        for label in labels {
            out.push_str(&format!("<span>{}</span>", escape(label)));
        }
        out.push_str("</div>");
    }
}

fn self_item(
    out: &mut String,
    section: &Section,
    q: &Question,
    phase: Phase,
    stored: Option<&AnswerValue>,
    retro: &RetroMap,
) {
    out.push_str(&format!(
        "<div class=\"assess-item\" data-item=\"{}\">",
        attr(&q.key)
    ));
    out.push_str(&format!(
        "<span class=\"assess-prompt\">{}</span>",
        escape(&q.prompt)
    ));

    let dual = section.retrospective && phase == Phase::Post;
    let name = self_control_name(&section.key, &q.key, dual);
    if dual {
        let pair = retro
            .get(&(section.key.clone(), q.key.clone()))
            .cloned()
            .unwrap_or_default();
        // "Before" is display-only: disabled controls never post back, so the
        // pre-phase value cannot be overwritten from here.
        out.push_str("<div class=\"assess-before\"><span class=\"assess-phase-tag\">Before</span>");
        retro_or_plain_control(out, "", q, pair.before.as_ref(), true);
        out.push_str("</div>");
        out.push_str("<div class=\"assess-now\"><span class=\"assess-phase-tag\">Now</span>");
        retro_or_plain_control(out, &name, q, pair.now.as_ref().or(stored), false);
        out.push_str("</div>");
    } else {
        question_control(out, &name, q, stored);
    }
    out.push_str("</div>\n");
}

fn retro_or_plain_control(
    out: &mut String,
    name: &str,
    q: &Question,
    current: Option<&AnswerValue>,
    disabled: bool,
) {
    match &q.qtype {
        QuestionType::Likert { values, anchors } | QuestionType::Scale { values, anchors } => {
            choice_group(out, name, values, anchors, current, q.required, disabled);
        }
        _ if disabled => {
            out.push_str("<span class=\"assess-frozen\">");
            out.push_str(&escape(&current.map(|v| v.display()).unwrap_or_default()));
            out.push_str("</span>");
        }
        _ => question_control(out, name, q, current),
    }
}

/// The sectioned self-assessment form. More than one section renders as
/// steps: one visible at a time, a step indicator on top, next blocked
/// client-side until the section's required items are answered, draft
/// reachable from anywhere.
pub fn render_self_form(
    record: &InstrumentRecord,
    rows: &[ResponseRow],
    retro: &RetroMap,
    instance: &Instance,
) -> String {
    let def = &record.def;
    let mut out = String::new();
    head(def, &mut out);

    if def.sections.is_empty() {
        out.push_str("<p class=\"assess-empty\">This instrument has no sections to display.</p>");
        return out;
    }

    let paginated = def.sections.len() > 1;
    out.push_str(&format!(
        "<form class=\"assess-form assess-self\" data-instance=\"{}\" data-phase=\"{}\" data-steps=\"{}\">\n",
        attr(&instance.id),
        instance.phase.as_str(),
        def.sections.len()
    ));

    if paginated {
        out.push_str("<ol class=\"assess-step-indicator\">");
        for (i, section) in def.sections.iter().enumerate() {
            out.push_str(&format!(
                "<li data-step=\"{}\"{}>{}</li>",
                i + 1,
                if i == 0 { " class=\"current\"" } else { "" },
                escape(&section.title)
            ));
        }
        out.push_str("</ol>\n");
    }

    for (i, section) in def.sections.iter().enumerate() {
        let hidden = if paginated && i > 0 {
            " assess-step-hidden"
        } else {
            ""
        };
        out.push_str(&format!(
            "<section class=\"assess-step{}\" data-step=\"{}\" data-section=\"{}\">\n",
            hidden,
            i + 1,
            attr(&section.key)
        ));
        out.push_str(&format!("<h3>{}</h3>\n", escape(&section.title)));
        scale_legend(def, section, &mut out);
        for q in &section.items {
            let stored = rows
                .iter()
                .find(|r| r.section_key == section.key && r.item_key == q.key)
                .map(|r| &r.value);
            self_item(&mut out, section, q, instance.phase, stored, retro);
        }
        out.push_str("</section>\n");
    }

    out.push_str("<div class=\"assess-nav\">");
    if paginated {
        out.push_str("<button type=\"button\" data-action=\"prev\" disabled>Previous</button>");
        out.push_str("<button type=\"button\" data-action=\"next\">Next</button>");
    }
    out.push_str("<button type=\"submit\" data-action=\"draft\" formnovalidate>Save draft</button>");
    out.push_str(&format!(
        "<button type=\"submit\" data-action=\"submit\"{}>Submit</button>",
        if paginated {
            " class=\"assess-final-step-only\""
        } else {
            ""
        }
    ));
    out.push_str("</div>\n</form>\n");
    out
}
