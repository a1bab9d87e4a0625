use crate::analyzer::Analyzer;
use crate::chunking::normalize_whitespace;
use crate::conversation::ResolvedQuestion;
use crate::embeddings::Embedder;
use crate::models::RetrievalOptions;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::traits::{KeywordIndex, VectorIndex};
use crate::{SearchError, VectorMetadata};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Retrieval {
    pub records: Vec<VectorMetadata>,
    pub resolved_query: String,
    /// Set when results were restricted to records mentioning this subject.
    pub subject_scope: Option<String>,
}

impl Retrieval {
    pub fn is_subject_miss(&self) -> bool {
        self.subject_scope.is_some() && self.records.is_empty()
    }
}

/// Hybrid vector + keyword retrieval with optional subject scoping.
pub struct Retriever<V, K, E>
where
    V: VectorIndex,
    K: KeywordIndex,
    E: Embedder,
{
    vector: V,
    keyword: K,
    embedder: E,
    analyzer: Arc<dyn Analyzer>,
    options: RetrievalOptions,
    retry: RetryPolicy,
}

impl<V, K, E> Retriever<V, K, E>
where
    V: VectorIndex,
    K: KeywordIndex,
    E: Embedder,
{
    pub fn new(vector: V, keyword: K, embedder: E, analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            vector,
            keyword,
            embedder,
            analyzer,
            options: RetrievalOptions::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_options(mut self, options: RetrievalOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Short queries cast a wider net.
    pub fn top_k_for(&self, query: &str) -> usize {
        if query.split_whitespace().count() <= self.options.short_query_tokens {
            self.options.short_query_top_k
        } else {
            self.options.default_top_k
        }
    }

    pub fn keyword_terms(&self, query: &str) -> Result<Vec<String>, SearchError> {
        let analysis = self.analyzer.analyze(query)?;
        let mut seen = HashSet::new();

        let entities = analysis
            .entities
            .iter()
            .map(|entity| entity.text.to_lowercase());
        let nouns = analysis
            .tokens
            .iter()
            .filter(|token| token.is_noun_like() && !token.is_stop)
            .map(|token| token.text.to_lowercase());

        Ok(entities
            .chain(nouns)
            .filter(|term| term.chars().count() >= 3)
            .filter(|term| seen.insert(term.clone()))
            .take(self.options.max_keyword_terms)
            .collect())
    }

    pub async fn search(
        &self,
        question: &ResolvedQuestion,
        top_k: Option<usize>,
    ) -> Result<Retrieval, SearchError> {
        let query = question.resolved.trim();
        if query.is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }

        let k = top_k.unwrap_or_else(|| self.top_k_for(query));
        let query_vector =
            retry_with_backoff(&self.retry, "embedding", || self.embedder.embed(query)).await?;
        let vector_hits = self.vector.search_vector(&query_vector, k)?;

        let terms = self.keyword_terms(query)?;
        let mut keyword_hits = Vec::new();
        for term in &terms {
            keyword_hits.extend(
                self.keyword
                    .search_keyword(term, self.options.keyword_hits_per_term)?,
            );
        }

        let vector_count = vector_hits.len();
        let keyword_count = keyword_hits.len();
        let mut records = merge_unique(
            vector_hits,
            keyword_hits,
            self.options.fingerprint_prefix_chars,
        );

        let subject_scope = match (&question.active_subject, question.subject_referenced) {
            (Some(subject), true) => {
                let needle = subject.to_lowercase();
                records.retain(|record| record.text.to_lowercase().contains(&needle));
                Some(subject.clone())
            }
            _ => None,
        };

        debug!(
            query,
            k,
            vector_hits = vector_count,
            keyword_hits = keyword_count,
            terms = ?terms,
            returned = records.len(),
            subject = ?subject_scope,
            "retrieval finished"
        );

        Ok(Retrieval {
            records,
            resolved_query: query.to_string(),
            subject_scope,
        })
    }
}

/// Hash of the normalized, lower-cased leading text of a record.
pub fn text_fingerprint(text: &str, prefix_chars: usize) -> String {
    let prefix: String = normalize_whitespace(text)
        .to_lowercase()
        .chars()
        .take(prefix_chars)
        .collect();
    let digest = Sha256::digest(prefix.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Vector hits first, then keyword hits, skipping any whose fingerprint was seen.
fn merge_unique(
    vector_hits: Vec<VectorMetadata>,
    keyword_hits: Vec<VectorMetadata>,
    prefix_chars: usize,
) -> Vec<VectorMetadata> {
    let mut seen = HashSet::new();
    vector_hits
        .into_iter()
        .chain(keyword_hits)
        .filter(|record| seen.insert(text_fingerprint(&record.text, prefix_chars)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::HeuristicAnalyzer;
    use crate::error::ServiceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn record(file: &str, chunk_id: u64, text: &str) -> VectorMetadata {
        VectorMetadata {
            file: file.to_string(),
            chunk_id,
            text: text.to_string(),
            page: Some(1),
            source: None,
            kind: None,
        }
    }

    struct FixedVectors(Vec<VectorMetadata>);

    impl VectorIndex for FixedVectors {
        fn search_vector(&self, _: &[f32], k: usize) -> Result<Vec<VectorMetadata>, SearchError> {
            Ok(self.0.iter().take(k).cloned().collect())
        }
    }

    struct SubstringKeywords(Vec<VectorMetadata>);

    impl KeywordIndex for SubstringKeywords {
        fn search_keyword(
            &self,
            term: &str,
            max_hits: usize,
        ) -> Result<Vec<VectorMetadata>, SearchError> {
            Ok(self
                .0
                .iter()
                .filter(|item| item.text.to_lowercase().contains(term))
                .take(max_hits)
                .cloned()
                .collect())
        }
    }

    struct UnitEmbedder;

    #[async_trait]
    impl Embedder for UnitEmbedder {
        fn dimensions(&self) -> usize {
            1
        }

        async fn embed(&self, _: &str) -> Result<Vec<f32>, ServiceError> {
            Ok(vec![1.0])
        }
    }

    struct ThrottledOnce(AtomicU32);

    #[async_trait]
    impl Embedder for ThrottledOnce {
        fn dimensions(&self) -> usize {
            1
        }

        async fn embed(&self, _: &str) -> Result<Vec<f32>, ServiceError> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ServiceError::RateLimited {
                    service: "embedding".to_string(),
                    details: "slow down".to_string(),
                });
            }
            Ok(vec![1.0])
        }
    }

    fn retriever<E: Embedder>(
        vectors: Vec<VectorMetadata>,
        keywords: Vec<VectorMetadata>,
        embedder: E,
    ) -> Result<Retriever<FixedVectors, SubstringKeywords, E>, ServiceError> {
        let analyzer: Arc<dyn Analyzer> = Arc::new(HeuristicAnalyzer::new()?);
        Ok(
            Retriever::new(FixedVectors(vectors), SubstringKeywords(keywords), embedder, analyzer)
                .with_retry(RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                }),
        )
    }

    fn scoped(resolved: &str, subject: &str) -> ResolvedQuestion {
        ResolvedQuestion {
            original: resolved.to_string(),
            resolved: resolved.to_string(),
            active_subject: Some(subject.to_string()),
            subject_referenced: true,
        }
    }

    #[tokio::test]
    async fn vector_hits_come_first_and_duplicates_collapse(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let shared = record("a.json", 0, "Dengue fever presents with high fever and rash.");
        let retriever = retriever(
            vec![shared.clone(), record("a.json", 1, "Rest and hydration.")],
            vec![
                record("b.json", 7, "  DENGUE fever presents with high   fever and rash."),
                record("b.json", 8, "Dengue warning signs include bleeding."),
            ],
            UnitEmbedder,
        )?;

        let retrieval = retriever
            .search(&ResolvedQuestion::standalone("How is dengue diagnosed in adults?"), None)
            .await?;

        let ids: Vec<(&str, u64)> = retrieval
            .records
            .iter()
            .map(|item| (item.file.as_str(), item.chunk_id))
            .collect();
        assert_eq!(ids, vec![("a.json", 0), ("a.json", 1), ("b.json", 8)]);
        assert_eq!(retrieval.subject_scope, None);
        Ok(())
    }

    #[tokio::test]
    async fn subject_scope_keeps_only_mentioning_records() -> Result<(), Box<dyn std::error::Error>>
    {
        let retriever = retriever(
            vec![
                record("p.json", 0, "Jane Tan is allergic to penicillin."),
                record("p.json", 1, "Ali bin Hassan is allergic to sulfa drugs."),
            ],
            Vec::new(),
            UnitEmbedder,
        )?;

        let retrieval = retriever
            .search(&scoped("What is Jane Tan's allergy?", "Jane Tan"), None)
            .await?;
        assert_eq!(retrieval.records.len(), 1);
        assert_eq!(retrieval.records[0].chunk_id, 0);
        assert!(!retrieval.is_subject_miss());

        let miss = retriever
            .search(&scoped("What is Mei Ling's allergy?", "Mei Ling"), None)
            .await?;
        assert!(miss.is_subject_miss());
        Ok(())
    }

    #[tokio::test]
    async fn unreferenced_subject_does_not_filter() -> Result<(), Box<dyn std::error::Error>> {
        let retriever = retriever(
            vec![record("g.json", 0, "Paracetamol adult dose is 500mg to 1g.")],
            Vec::new(),
            UnitEmbedder,
        )?;
        let mut question = scoped("What is the paracetamol dose?", "Jane Tan");
        question.subject_referenced = false;

        let retrieval = retriever.search(&question, None).await?;
        assert_eq!(retrieval.records.len(), 1);
        assert!(!retrieval.is_subject_miss());
        Ok(())
    }

    #[tokio::test]
    async fn throttled_embedding_is_retried() -> Result<(), Box<dyn std::error::Error>> {
        let retriever = retriever(
            vec![record("a.json", 0, "Asthma action plan.")],
            Vec::new(),
            ThrottledOnce(AtomicU32::new(0)),
        )?;
        let retrieval = retriever
            .search(&ResolvedQuestion::standalone("asthma plan"), None)
            .await?;
        assert_eq!(retrieval.records.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn empty_query_is_rejected() -> Result<(), ServiceError> {
        let retriever = retriever(Vec::new(), Vec::new(), UnitEmbedder)?;
        let result = retriever
            .search(&ResolvedQuestion::standalone("   "), None)
            .await;
        assert!(matches!(result, Err(SearchError::Request(_))));
        Ok(())
    }

    #[test]
    fn short_queries_get_more_results() -> Result<(), ServiceError> {
        let retriever = retriever(Vec::new(), Vec::new(), UnitEmbedder)?;
        assert_eq!(retriever.top_k_for("dengue symptoms"), 8);
        assert_eq!(retriever.top_k_for("what are dengue symptoms"), 5);
        Ok(())
    }

    #[test]
    fn fingerprint_ignores_case_and_spacing() {
        assert_eq!(
            text_fingerprint("Fever  and\nRash", 120),
            text_fingerprint("fever and rash", 120)
        );
        assert_ne!(text_fingerprint("fever", 120), text_fingerprint("rash", 120));
        assert_eq!(
            text_fingerprint("same prefix, different tail A", 11),
            text_fingerprint("same prefix, different tail B", 11)
        );
    }
}
