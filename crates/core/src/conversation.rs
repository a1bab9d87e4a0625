use crate::analyzer::{is_stop_word, Analysis, Analyzer, PartOfSpeech};
use crate::error::{SearchError, ServiceError};
use crate::models::{ConversationOptions, Role, Turn};
use regex::{Captures, Regex};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Words and phrases signalling that a question continues the previous topic.
const CONTINUITY_MARKERS: &[&str] = &[
    "his", "her", "hers", "their", "theirs", "its", "it", "this", "that", "these", "those",
    "same", "the patient", "this patient",
];

/// Words and phrases that stand in for the active subject.
const SUBJECT_TERMS: &[&str] = &[
    "he", "she", "him", "his", "her", "hers", "they", "them", "their", "theirs",
    "the patient", "this patient", "that patient", "the person",
];

const DOMAIN_CONDITIONS: &[&str] = &[
    "allergy", "allergies", "anaemia", "anemia", "arthritis", "asthma", "bronchitis",
    "cancer", "cough", "covid", "dengue", "depression", "diabetes", "diarrhea", "diarrhoea",
    "eczema", "fever", "flu", "fracture", "gastritis", "headache", "hepatitis",
    "hypertension", "infection", "influenza", "malaria", "migraine", "nausea", "obesity",
    "pain", "pneumonia", "rash", "sepsis", "stroke", "tuberculosis", "vomiting",
];

const GENERIC_NOUNS: &[&str] = &[
    "case", "condition", "conditions", "details", "disease", "diseases", "illness", "issue",
    "issues", "information", "patient", "patients", "person", "problem", "problems", "record",
    "records", "sign", "signs", "symptom", "symptoms", "thing", "things",
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubjectState {
    #[default]
    NoSubject,
    SubjectActive(String),
}

impl SubjectState {
    /// A blank name never activates a subject.
    pub fn activate(name: &str) -> Self {
        let name = name.trim();
        if name.is_empty() {
            Self::NoSubject
        } else {
            Self::SubjectActive(name.to_string())
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::NoSubject => None,
            Self::SubjectActive(name) => Some(name),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::SubjectActive(_))
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    session_id: String,
    history: VecDeque<Turn>,
    subject: SubjectState,
    history_capacity: usize,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, history_capacity: usize) -> Self {
        Self {
            session_id: session_id.into(),
            history: VecDeque::new(),
            subject: SubjectState::NoSubject,
            history_capacity: history_capacity.max(2),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subject(&self) -> &SubjectState {
        &self.subject
    }

    pub fn active_subject(&self) -> Option<&str> {
        self.subject.name()
    }

    pub fn set_subject(&mut self, subject: SubjectState) {
        self.subject = subject;
    }

    pub fn history(&self) -> &VecDeque<Turn> {
        &self.history
    }

    /// The most recent `window` turns, oldest first.
    pub fn replay(&self, window: usize) -> Vec<Turn> {
        let skip = self.history.len().saturating_sub(window);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn last_user_turn(&self) -> Option<&Turn> {
        self.history.iter().rev().find(|turn| turn.role == Role::User)
    }

    pub fn record(&mut self, question: &str, answer: &str) {
        self.history.push_back(Turn::new(Role::User, question));
        self.history.push_back(Turn::new(Role::Assistant, answer));
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn apply(&mut self, resolution: &Resolution) {
        if resolution.reset_history {
            self.clear_history();
        }
        self.subject = resolution.subject.clone();
    }
}

pub struct ResolutionInput<'a> {
    pub question: &'a str,
    pub analysis: &'a Analysis,
    pub last_user_analysis: Option<&'a Analysis>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub resolved_query: String,
    pub subject: SubjectState,
    pub reset_history: bool,
    pub continuity: bool,
    pub subject_referenced: bool,
    pub detected_subject: Option<String>,
}

/// The question as handed to retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuestion {
    pub original: String,
    pub resolved: String,
    pub active_subject: Option<String>,
    /// The original question named a subject or used a pronoun standing for one.
    pub subject_referenced: bool,
}

impl ResolvedQuestion {
    /// A question used verbatim, outside any conversation.
    pub fn standalone(question: &str) -> Self {
        Self {
            original: question.to_string(),
            resolved: question.to_string(),
            active_subject: None,
            subject_referenced: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubjectResolver {
    options: ConversationOptions,
    reference_re: Regex,
    it_re: Regex,
    next_word_re: Regex,
}

impl SubjectResolver {
    pub fn new(options: ConversationOptions) -> Result<Self, regex::Error> {
        let alternatives = SUBJECT_TERMS
            .iter()
            .map(|term| regex::escape(term).replace(' ', r"\s+"))
            .collect::<Vec<_>>()
            .join("|");

        Ok(Self {
            options,
            reference_re: Regex::new(&format!(r"(?i)\b(?:{alternatives})\b"))?,
            it_re: Regex::new(r"(?i)\bit\b")?,
            next_word_re: Regex::new(r"^\s+([A-Za-z]+)")?,
        })
    }

    pub fn options(&self) -> &ConversationOptions {
        &self.options
    }

    /// Named entities with a tracked label, else a short run of proper nouns.
    pub fn detect_subjects(&self, analysis: &Analysis) -> Vec<String> {
        let entities: Vec<String> = analysis
            .entities
            .iter()
            .filter(|entity| self.options.entity_labels.contains(&entity.label))
            .map(|entity| entity.text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect();
        if !entities.is_empty() {
            return entities;
        }

        let run: Vec<&str> = analysis
            .tokens
            .iter()
            .skip_while(|token| token.pos != PartOfSpeech::ProperNoun)
            .take_while(|token| token.pos == PartOfSpeech::ProperNoun)
            .take(self.options.max_fallback_run.max(1))
            .map(|token| strip_possessive(&token.text))
            .collect();

        if run.is_empty() {
            Vec::new()
        } else {
            vec![run.join(" ")]
        }
    }

    /// Replaces subject pronouns and generic subject phrases with `name`.
    pub fn rewrite_references(&self, question: &str, name: &str) -> String {
        let possessive = format!("{name}'s");

        self.reference_re
            .replace_all(question, |caps: &Captures<'_>| {
                let Some(found) = caps.get(0) else {
                    return String::new();
                };
                let term = found.as_str().to_lowercase();

                match term.as_str() {
                    "his" | "hers" | "their" | "theirs" => possessive.clone(),
                    "her" => {
                        let rest = &question[found.end()..];
                        let followed_by_noun = self
                            .next_word_re
                            .captures(rest)
                            .and_then(|next| next.get(1))
                            .is_some_and(|word| !is_stop_word(word.as_str()));
                        if followed_by_noun {
                            possessive.clone()
                        } else {
                            name.to_string()
                        }
                    }
                    _ => name.to_string(),
                }
            })
            .into_owned()
    }
}

/// Decides the next subject state and rewrites the question for retrieval.
///
/// Pure over the analyses and the prior state; [`SessionState::apply`] commits the result.
pub fn resolve_question(
    resolver: &SubjectResolver,
    input: &ResolutionInput<'_>,
    prior: &SessionState,
) -> Resolution {
    let words = lowercase_words(input.question);
    let candidates = resolver.detect_subjects(input.analysis);
    let has_subject_term = contains_any(&words, SUBJECT_TERMS);
    let has_marker = contains_any(&words, CONTINUITY_MARKERS);

    let overlap = overlap_ratio(input.analysis, prior.history.iter().rev().take(4));
    let continuity = has_marker || overlap > resolver.options.overlap_threshold;

    let reset_history = !continuity;
    let subject = match candidates.first() {
        Some(first) => SubjectState::activate(first),
        None if has_subject_term => prior.subject.clone(),
        None => SubjectState::NoSubject,
    };

    let mut resolved_query = input.question.to_string();
    if let Some(name) = subject.name() {
        resolved_query = resolver.rewrite_references(&resolved_query, name);
    }
    if words.iter().any(|word| word == "it") {
        let referent = if reset_history {
            None
        } else {
            input.last_user_analysis.and_then(salient_referent)
        };
        if let Some(referent) = referent {
            resolved_query = resolver
                .it_re
                .replace_all(&resolved_query, referent.as_str())
                .into_owned();
        }
    }

    Resolution {
        resolved_query,
        subject,
        reset_history,
        continuity,
        subject_referenced: !candidates.is_empty() || has_subject_term,
        detected_subject: candidates.into_iter().next(),
    }
}

/// Domain vocabulary wins over other nouns; generic nouns and names never qualify.
pub fn salient_referent(analysis: &Analysis) -> Option<String> {
    let nouns: Vec<String> = analysis
        .tokens
        .iter()
        .filter(|token| token.is_noun_like() && !token.is_stop)
        .map(|token| token.text.to_lowercase())
        .collect();

    nouns
        .iter()
        .find(|noun| DOMAIN_CONDITIONS.contains(&noun.as_str()))
        .cloned()
        .or_else(|| {
            analysis
                .tokens
                .iter()
                .filter(|token| token.pos == PartOfSpeech::Noun && !token.is_stop)
                .map(|token| token.text.to_lowercase())
                .find(|noun| !GENERIC_NOUNS.contains(&noun.as_str()))
        })
}

fn strip_possessive(word: &str) -> &str {
    word.strip_suffix("'s")
        .or_else(|| word.strip_suffix("’s"))
        .unwrap_or(word)
}

fn lowercase_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn contains_any(words: &[String], table: &[&str]) -> bool {
    table.iter().any(|entry| {
        let parts: Vec<&str> = entry.split(' ').collect();
        words
            .windows(parts.len())
            .any(|window| window.iter().zip(&parts).all(|(word, part)| word == part))
    })
}

fn content_words(analysis: &Analysis) -> HashSet<String> {
    analysis
        .tokens
        .iter()
        .filter(|token| !token.is_stop && token.text.chars().count() >= 3)
        .filter(|token| token.text.chars().all(char::is_alphabetic))
        .map(|token| token.text.to_lowercase())
        .collect()
}

/// Share of the question's content words that already appeared in `turns`.
fn overlap_ratio<'a>(analysis: &Analysis, turns: impl Iterator<Item = &'a Turn>) -> f64 {
    let question = content_words(analysis);
    if question.is_empty() {
        return 0.0;
    }

    let history: HashSet<String> = turns
        .flat_map(|turn| lowercase_words(&turn.content))
        .filter(|word| word.chars().count() >= 3 && !is_stop_word(word))
        .collect();

    let shared = question.iter().filter(|word| history.contains(*word)).count();
    shared as f64 / question.len() as f64
}

/// Analyzer-backed front end of [`SubjectResolver`].
pub struct ConversationContext {
    analyzer: Arc<dyn Analyzer>,
    resolver: SubjectResolver,
}

impl ConversationContext {
    pub fn new(analyzer: Arc<dyn Analyzer>, options: ConversationOptions) -> Result<Self, SearchError> {
        Ok(Self {
            analyzer,
            resolver: SubjectResolver::new(options)?,
        })
    }

    pub fn options(&self) -> &ConversationOptions {
        self.resolver.options()
    }

    pub fn prepare(
        &self,
        state: &mut SessionState,
        question: &str,
    ) -> Result<ResolvedQuestion, ServiceError> {
        let analysis = self.analyzer.analyze(question)?;
        let last_user_analysis = state
            .last_user_turn()
            .map(|turn| self.analyzer.analyze(&turn.content))
            .transpose()?;

        let resolution = resolve_question(
            &self.resolver,
            &ResolutionInput {
                question,
                analysis: &analysis,
                last_user_analysis: last_user_analysis.as_ref(),
            },
            state,
        );

        debug!(
            session = state.session_id(),
            continuity = resolution.continuity,
            reset_history = resolution.reset_history,
            subject = ?resolution.subject.name(),
            resolved = %resolution.resolved_query,
            "question resolved"
        );
        state.apply(&resolution);

        Ok(ResolvedQuestion {
            original: question.to_string(),
            resolved: resolution.resolved_query,
            active_subject: state.active_subject().map(str::to_string),
            subject_referenced: resolution.subject_referenced,
        })
    }

    pub fn record(&self, state: &mut SessionState, question: &str, answer: &str) {
        state.record(question, answer);
    }
}
