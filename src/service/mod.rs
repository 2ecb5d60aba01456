pub mod active_streams;
pub mod approvals;
pub mod chat_service;
pub mod embedding_worker;
pub mod embeddings;
pub mod search_service;

pub use active_streams::{ActiveStreams, StreamGuard};
pub use approvals::ApprovalBroker;
pub use chat_service::ChatService;
pub use embedding_worker::{EmbeddingIndexer, EmbeddingWorker, WorkerHandle, WorkerStatus};
pub use embeddings::{Embedder, EmbeddingService};
pub use search_service::SearchService;
