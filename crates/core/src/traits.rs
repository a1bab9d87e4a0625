use crate::{SearchError, VectorMetadata};
use std::sync::Arc;

pub trait VectorIndex: Send + Sync {
    /// Up to `k` nearest records, closest first.
    fn search_vector(&self, query_vector: &[f32], k: usize)
        -> Result<Vec<VectorMetadata>, SearchError>;
}

pub trait KeywordIndex: Send + Sync {
    /// Records whose text contains `term`, ignoring case, capped at `max_hits`.
    fn search_keyword(&self, term: &str, max_hits: usize)
        -> Result<Vec<VectorMetadata>, SearchError>;
}

impl<T: VectorIndex + ?Sized> VectorIndex for Arc<T> {
    fn search_vector(
        &self,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMetadata>, SearchError> {
        (**self).search_vector(query_vector, k)
    }
}

impl<T: KeywordIndex + ?Sized> KeywordIndex for Arc<T> {
    fn search_keyword(
        &self,
        term: &str,
        max_hits: usize,
    ) -> Result<Vec<VectorMetadata>, SearchError> {
        (**self).search_keyword(term, max_hits)
    }
}
