use crate::models::{Role, Turn};
use crate::VectorMetadata;

pub const NOT_APPLICABLE: &str = "N/A";

fn format_context(records: &[VectorMetadata]) -> String {
    records
        .iter()
        .map(|record| {
            let page = record
                .page
                .map(|page| format!(", page {page}"))
                .unwrap_or_default();
            format!("[{}{}]\n{}", record.file, page, record.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_history(history: &[Turn]) -> String {
    history
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{speaker}: {}", turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn answer_prompt(history: &[Turn], records: &[VectorMetadata], question: &str) -> String {
    let mut prompt = String::from(
        "You answer questions about medical records. Use only the context below. \
         If the context does not contain the answer, say so plainly.\n\n",
    );
    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        prompt.push_str(&format_history(history));
        prompt.push_str("\n\n");
    }
    prompt.push_str("Context:\n");
    prompt.push_str(&format_context(records));
    prompt.push_str("\n\nQuestion: ");
    prompt.push_str(question);
    prompt.push_str("\nAnswer:");
    prompt
}

pub fn highlight_prompt(question: &str, text: &str) -> String {
    format!(
        "Copy the single sentence from the passage that best answers the question. \
         Reply with {NOT_APPLICABLE} if none does.\n\nQuestion: {question}\n\nPassage:\n{text}"
    )
}

pub fn suggestion_prompt(question: &str, answer: &str) -> String {
    format!(
        "Suggest three short follow-up questions a clinician might ask next, one per line, \
         without numbering.\n\nQuestion: {question}\nAnswer: {answer}"
    )
}

pub fn subject_miss_answer(subject: &str) -> String {
    format!("I could not find any records for {subject}.")
}

/// Non-empty lines with list markers stripped, capped at `limit`.
pub fn parse_suggestions(raw: &str, limit: usize) -> Vec<String> {
    raw.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '-' | '*' | '.' | ')'))
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .take(limit)
        .collect()
}
