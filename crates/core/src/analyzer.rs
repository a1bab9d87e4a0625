use crate::error::ServiceError;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PartOfSpeech {
    Noun,
    ProperNoun,
    Pronoun,
    Verb,
    Determiner,
    Number,
    Punctuation,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub text: String,
    pub pos: PartOfSpeech,
    pub is_stop: bool,
}

impl Token {
    pub fn is_noun_like(&self) -> bool {
        matches!(self.pos, PartOfSpeech::Noun | PartOfSpeech::ProperNoun)
    }
}

/// A labelled span; `start`/`end` are byte offsets into the analyzed text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub label: String,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Analysis {
    pub entities: Vec<Entity>,
    pub tokens: Vec<Token>,
}

pub trait Analyzer: Send + Sync {
    fn analyze(&self, text: &str) -> Result<Analysis, ServiceError>;
}

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "done", "down", "during", "each",
    "explain", "describe", "few", "for", "from", "further", "get", "give", "had", "has",
    "have", "having", "he", "her", "here", "hers", "him", "his", "how", "i", "if", "in",
    "into", "is", "it", "its", "just", "list", "me", "more", "most", "my", "no", "nor", "not",
    "now", "of", "off", "on", "once", "only", "or", "other", "our", "out", "over", "own",
    "please", "same", "she", "should", "show", "so", "some", "such", "tell", "than", "that",
    "the", "their", "theirs", "them", "then", "there", "these", "they", "this", "those",
    "through", "to", "too", "under", "until", "up", "very", "was", "we", "were", "what",
    "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would", "you",
    "your",
];

const PRONOUNS: &[&str] = &[
    "i", "me", "my", "we", "our", "you", "your", "he", "him", "his", "she", "her", "hers",
    "it", "its", "they", "them", "their", "theirs",
];

const DETERMINERS: &[&str] = &[
    "a", "an", "the", "this", "that", "these", "those", "each", "every", "any", "some",
];

const VERBS: &[&str] = &[
    "is", "are", "was", "were", "be", "been", "has", "have", "had", "do", "does", "did",
    "take", "takes", "tell", "give", "show", "list", "describe", "explain", "prescribe",
    "treat", "suffer", "suffers",
];

/// Lower-case words that may sit between the parts of a personal name.
const NAME_CONNECTORS: &[&str] = &["bin", "binti", "bte", "bt", "van", "von", "de", "da", "al"];

pub fn is_stop_word(word: &str) -> bool {
    let lowered = word.to_lowercase();
    STOP_WORDS.contains(&lowered.as_str())
}

/// Rule-based tagger sized for short clinical questions.
#[derive(Debug, Clone)]
pub struct HeuristicAnalyzer {
    word_re: Regex,
}

impl HeuristicAnalyzer {
    pub fn new() -> Result<Self, ServiceError> {
        let word_re = Regex::new(r"[A-Za-z0-9]+(?:['’][A-Za-z]+)?|[^\sA-Za-z0-9]")
            .map_err(|error| ServiceError::Analyzer(error.to_string()))?;
        Ok(Self { word_re })
    }

    fn tag(word: &str, sentence_start: bool, next_capitalized: bool) -> PartOfSpeech {
        let lowered = word.to_lowercase();
        let first = word.chars().next();

        if first.is_some_and(|c| !c.is_alphanumeric()) {
            return PartOfSpeech::Punctuation;
        }
        if word.chars().all(|c| c.is_ascii_digit()) {
            return PartOfSpeech::Number;
        }
        if PRONOUNS.contains(&lowered.as_str()) {
            return PartOfSpeech::Pronoun;
        }
        if DETERMINERS.contains(&lowered.as_str()) {
            return PartOfSpeech::Determiner;
        }
        if VERBS.contains(&lowered.as_str()) {
            return PartOfSpeech::Verb;
        }
        if STOP_WORDS.contains(&lowered.as_str()) {
            return PartOfSpeech::Other;
        }

        let capitalized = first.is_some_and(char::is_uppercase);
        if capitalized && (!sentence_start || next_capitalized) {
            return PartOfSpeech::ProperNoun;
        }
        if lowered.ends_with("ing") || lowered.ends_with("ed") {
            return PartOfSpeech::Verb;
        }
        PartOfSpeech::Noun
    }
}

impl Analyzer for HeuristicAnalyzer {
    fn analyze(&self, text: &str) -> Result<Analysis, ServiceError> {
        let matches: Vec<_> = self.word_re.find_iter(text).collect();
        let mut tokens = Vec::with_capacity(matches.len());
        let mut sentence_start = true;

        for (index, found) in matches.iter().enumerate() {
            let word = found.as_str();
            let next_capitalized = matches.get(index + 1).is_some_and(|next| {
                let next_word = next.as_str();
                next_word.chars().next().is_some_and(char::is_uppercase)
                    && !is_stop_word(next_word)
            });

            let pos = Self::tag(word, sentence_start, next_capitalized);
            tokens.push(Token {
                text: word.to_string(),
                pos,
                is_stop: is_stop_word(word),
            });

            sentence_start = matches!(word, "." | "?" | "!");
        }

        let mut entities = Vec::new();
        let mut index = 0;
        while index < tokens.len() {
            if tokens[index].pos != PartOfSpeech::ProperNoun {
                index += 1;
                continue;
            }

            let mut end = index;
            let mut cursor = index + 1;
            while cursor < tokens.len() {
                match tokens[cursor].pos {
                    PartOfSpeech::ProperNoun => {
                        end = cursor;
                        cursor += 1;
                    }
                    _ if NAME_CONNECTORS.contains(&tokens[cursor].text.as_str())
                        && tokens
                            .get(cursor + 1)
                            .is_some_and(|next| next.pos == PartOfSpeech::ProperNoun) =>
                    {
                        cursor += 1;
                    }
                    _ => break,
                }
            }

            let proper_count = tokens[index..=end]
                .iter()
                .filter(|token| token.pos == PartOfSpeech::ProperNoun)
                .count();
            if proper_count >= 2 {
                let start = matches[index].start();
                let mut stop = matches[end].end();
                if let Some(suffix) = ["'s", "’s"]
                    .into_iter()
                    .find(|suffix| text[start..stop].ends_with(suffix))
                {
                    stop -= suffix.len();
                }
                entities.push(Entity {
                    label: "PERSON".to_string(),
                    text: text[start..stop].to_string(),
                    start,
                    end: stop,
                });
            }
            index = end + 1;
        }

        Ok(Analysis { entities, tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(text: &str) -> Analysis {
        HeuristicAnalyzer::new()
            .and_then(|analyzer| analyzer.analyze(text))
            .unwrap_or_default()
    }

    #[test]
    fn malay_names_with_connectors_are_people() {
        let analysis = analyze("Does Ali bin Hassan have any allergies?");
        assert_eq!(analysis.entities.len(), 1);
        assert_eq!(analysis.entities[0].text, "Ali bin Hassan");
        assert_eq!(analysis.entities[0].label, "PERSON");
    }

    #[test]
    fn sentence_initial_words_are_not_proper_nouns() {
        let analysis = analyze("Tell me about diabetes");
        assert!(analysis.entities.is_empty());
        assert!(analysis
            .tokens
            .iter()
            .all(|token| token.pos != PartOfSpeech::ProperNoun));
        let diabetes = analysis.tokens.iter().find(|token| token.text == "diabetes");
        assert_eq!(diabetes.map(|token| token.pos), Some(PartOfSpeech::Noun));
    }

    #[test]
    fn possessive_suffix_is_not_part_of_the_name() {
        let analysis = analyze("What is Ali bin Hassan's allergy?");
        assert_eq!(analysis.entities[0].text, "Ali bin Hassan");
    }

    #[test]
    fn leading_full_name_is_detected() {
        let analysis = analyze("Jane Tan has a fever.");
        assert_eq!(analysis.entities[0].text, "Jane Tan");
        assert_eq!(analysis.entities[0].start, 0);
    }

    #[test]
    fn pronouns_and_stop_words_are_tagged() {
        let analysis = analyze("What is his allergy?");
        let his = analysis.tokens.iter().find(|token| token.text == "his");
        assert_eq!(his.map(|token| (token.pos, token.is_stop)), Some((PartOfSpeech::Pronoun, true)));
        let allergy = analysis.tokens.iter().find(|token| token.text == "allergy");
        assert_eq!(allergy.map(|token| token.is_stop), Some(false));
    }
}
