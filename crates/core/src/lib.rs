pub mod analyzer;
pub mod assistant;
pub mod chunking;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod models;
pub mod prompts;
pub mod retriever;
pub mod retry;
pub mod session;
pub mod store;
pub mod structured;
pub mod traits;

pub use analyzer::{Analysis, Analyzer, Entity, HeuristicAnalyzer, PartOfSpeech, Token};
pub use assistant::Assistant;
pub use chunking::{normalize_whitespace, split_with_overlap, LineChunker, Segment};
pub use conversation::{
    resolve_question, ConversationContext, ResolvedQuestion, SessionState, SubjectResolver,
    SubjectState,
};
pub use embeddings::{CharacterNgramEmbedder, Embedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{IngestError, SearchError, ServiceError, StoreError};
pub use generation::{AnswerGenerator, HttpGenerator, InferenceConfig};
pub use ingest::{
    chunk_line_file, discover_json_files, ingest_folder, ingest_records, load_chunk_records,
    load_line_records, FileIngestion, IngestionReport, LoadedRecords, SkippedFile,
};
pub use models::{
    AnswerPayload, BoundingBox, Chunk, ChunkRecord, ChunkingOptions, ConversationOptions,
    DedupKey, Line, RetrievalOptions, Role, SessionOptions, SourceCitation, Turn, VectorMetadata,
};
pub use retriever::{Retrieval, Retriever};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use session::{SessionHandle, SessionManager};
pub use store::{AddOutcome, FlatL2Index, VectorStore};
pub use structured::{extract_patient_record, PatientExtractor, PatientRecord, PatientRegistry};
pub use traits::{KeywordIndex, VectorIndex};
