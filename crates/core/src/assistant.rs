use crate::conversation::ConversationContext;
use crate::embeddings::Embedder;
use crate::generation::AnswerGenerator;
use crate::models::{AnswerPayload, SourceCitation};
use crate::prompts;
use crate::retriever::Retriever;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::session::SessionManager;
use crate::traits::{KeywordIndex, VectorIndex};
use crate::SearchError;
use tracing::{debug, info};

const MAX_SUGGESTIONS: usize = 3;

/// Conversational question answering over the indexed records.
pub struct Assistant<V, K, E, G>
where
    V: VectorIndex,
    K: KeywordIndex,
    E: Embedder,
    G: AnswerGenerator,
{
    sessions: SessionManager,
    conversation: ConversationContext,
    retriever: Retriever<V, K, E>,
    generator: G,
    retry: RetryPolicy,
}

impl<V, K, E, G> Assistant<V, K, E, G>
where
    V: VectorIndex,
    K: KeywordIndex,
    E: Embedder,
    G: AnswerGenerator,
{
    pub fn new(
        sessions: SessionManager,
        conversation: ConversationContext,
        retriever: Retriever<V, K, E>,
        generator: G,
    ) -> Self {
        Self {
            sessions,
            conversation,
            retriever,
            generator,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    async fn generate(&self, prompt: &str) -> Result<String, SearchError> {
        Ok(retry_with_backoff(&self.retry, "generation", || self.generator.generate(prompt)).await?)
    }

    /// Answers `question` within `session_id`, updating that session's subject and history.
    pub async fn ask(&self, session_id: &str, question: &str) -> Result<AnswerPayload, SearchError> {
        if question.trim().is_empty() {
            return Err(SearchError::Request("question is empty".to_string()));
        }

        let handle = self.sessions.handle(session_id);
        let mut state = handle.lock().await;

        let resolved = self.conversation.prepare(&mut state, question)?;
        let retrieval = self.retriever.search(&resolved, None).await?;

        if let (true, Some(subject)) = (retrieval.is_subject_miss(), &retrieval.subject_scope) {
            info!(session = session_id, subject = %subject, "no records for subject");
            let answer = prompts::subject_miss_answer(subject);
            self.conversation.record(&mut state, question, &answer);
            return Ok(AnswerPayload {
                question: question.to_string(),
                resolved_query: retrieval.resolved_query,
                answer,
                sources: Vec::new(),
                suggestions: Vec::new(),
            });
        }

        let history = state.replay(self.conversation.options().replay_window);
        let answer = self
            .generate(&prompts::answer_prompt(
                &history,
                &retrieval.records,
                &retrieval.resolved_query,
            ))
            .await?;

        let mut sources = Vec::with_capacity(retrieval.records.len());
        for record in &retrieval.records {
            let highlight = self
                .generate(&prompts::highlight_prompt(&retrieval.resolved_query, &record.text))
                .await?;
            sources.push(SourceCitation {
                file: record.file.clone(),
                page: record.page,
                source: record.source.clone(),
                highlight: highlight.trim().to_string(),
            });
        }

        let raw_suggestions = self
            .generate(&prompts::suggestion_prompt(&retrieval.resolved_query, &answer))
            .await?;
        let suggestions = prompts::parse_suggestions(&raw_suggestions, MAX_SUGGESTIONS);

        self.conversation.record(&mut state, question, &answer);
        debug!(
            session = session_id,
            sources = sources.len(),
            suggestions = suggestions.len(),
            "answer assembled"
        );

        Ok(AnswerPayload {
            question: question.to_string(),
            resolved_query: retrieval.resolved_query,
            answer,
            sources,
            suggestions,
        })
    }
}
