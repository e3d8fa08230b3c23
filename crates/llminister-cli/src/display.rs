//! Vertical card display for questions and artifacts.
//!
//! A question card groups its fields into sections (identity, provenance,
//! workflow, answer). Empty sections are left out; a structured answer is
//! followed by the sources its sentences cite.

use std::fmt::Write;

use llminister_core::{Answer, Artifact, Question, QuestionBatch, StageKind, Transcript};
use llminister_pipeline::RunReport;

const MAX_LIST_ITEMS: usize = 10;
const TEXT_PREVIEW: usize = 72;

// ── Public API ──

pub fn print_question_card(question: &Question) {
    print!("{}", question_card(question));
}

pub fn print_question_table(questions: &[Question]) {
    print!("{}", question_table(questions));
}

pub fn print_artifact_table(artifacts: &[Artifact]) {
    for artifact in artifacts {
        println!(
            "  {:<16} {}  {}",
            artifact.label(),
            artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
            artifact_summary(artifact)
        );
    }
}

pub fn print_run_report(report: &RunReport) {
    print!("{}", run_summary(report));
}

// ── Question card ──

fn question_card(q: &Question) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== {} ===", q.id);
    let _ = writeln!(out, "{}", q.text);
    out.push('\n');

    section(
        &mut out,
        "Identity",
        &[
            ("category", q.category.clone()),
            ("created", q.created_at.to_rfc3339()),
            ("updated", q.updated_at.to_rfc3339()),
        ],
    );
    section(
        &mut out,
        "Provenance",
        &[
            ("speaker", q.speaker.clone()),
            ("party", q.party.clone()),
            ("video_timestamp", q.video_timestamp.clone()),
        ],
    );
    section(
        &mut out,
        "Workflow",
        &[
            ("status", q.status.to_string()),
            ("next_action", q.next_action.clone()),
            ("person_responsible", q.person_responsible.clone()),
        ],
    );
    answer_section(&mut out, &q.answer);
    out
}

fn section(out: &mut String, header: &str, rows: &[(&str, String)]) {
    if rows.iter().all(|(_, value)| value.trim().is_empty()) {
        return;
    }
    let _ = writeln!(out, "{header}");
    for (name, value) in rows {
        if !value.trim().is_empty() {
            let _ = writeln!(out, "  {name:<20} {value}");
        }
    }
    out.push('\n');
}

fn answer_section(out: &mut String, answer: &Answer) {
    match answer {
        Answer::Empty => {}
        Answer::Text(text) => {
            if text.trim().is_empty() {
                return;
            }
            let _ = writeln!(out, "Answer");
            let _ = writeln!(out, "  {text}");
            out.push('\n');
        }
        Answer::Structured(data) => {
            let _ = writeln!(out, "Answer");
            for sentence in data.sentences() {
                let ids: Vec<&str> = sentence
                    .citations
                    .iter()
                    .map(|c| c.source_id.as_str())
                    .collect();
                if ids.is_empty() {
                    let _ = writeln!(out, "  {}", sentence.text);
                } else {
                    let _ = writeln!(out, "  {} [{}]", sentence.text, ids.join(", "));
                }
            }
            out.push('\n');

            let cited = data.cited_sources();
            if cited.is_empty() {
                return;
            }
            let _ = writeln!(out, "  Sources ({}):", cited.len());
            for source in cited.iter().take(MAX_LIST_ITEMS) {
                let _ = writeln!(
                    out,
                    "    {:<4} {}, p. {}  ({:.2})",
                    source.id, source.title, source.page, source.similarity_score
                );
                let _ = writeln!(out, "         {}", source.file_path);
            }
            if cited.len() > MAX_LIST_ITEMS {
                let _ = writeln!(out, "    ... and {} more", cited.len() - MAX_LIST_ITEMS);
            }
            out.push('\n');
        }
    }
}

// ── Tables ──

fn question_table(questions: &[Question]) -> String {
    let mut out = String::new();
    for q in questions {
        let answered = if q.answer.is_empty() { " " } else { "*" };
        let _ = writeln!(
            out,
            "{}  {:<9} {} {}",
            q.id,
            q.status.as_str(),
            answered,
            truncate(&q.text, TEXT_PREVIEW)
        );
    }
    let _ = writeln!(out, "{} question(s)", questions.len());
    out
}

fn artifact_summary(artifact: &Artifact) -> String {
    match artifact.stage_kind {
        StageKind::Transcribe => match artifact.decode::<Transcript>() {
            Ok(t) => format!("{} ({} utterances)", t.source, t.utterances.len()),
            Err(e) => format!("(unreadable: {e})"),
        },
        StageKind::Extract | StageKind::Answer => match artifact.decode::<QuestionBatch>() {
            Ok(batch) => format!("{} question(s)", batch.questions.len()),
            Err(e) => format!("(unreadable: {e})"),
        },
    }
}

fn run_summary(report: &RunReport) -> String {
    let mut out = String::new();
    for outcome in &report.stages {
        let mut line = format!("  {:<12} {}", outcome.stage.as_str(), outcome.state);
        if let Some(artifact) = &outcome.artifact {
            let _ = write!(line, "  -> {}", artifact.label());
        }
        if let Some(r) = &outcome.reconcile {
            let _ = write!(
                line,
                "  ({} new, {} updated, {} unchanged)",
                r.inserted(),
                r.updated(),
                r.unchanged()
            );
        }
        let _ = writeln!(out, "{line}");
    }
    if report.stages.is_empty() {
        let _ = writeln!(out, "  (no stages)");
    }
    out
}

/// Cut to at most `max` characters, marking the cut with an ellipsis.
fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}
