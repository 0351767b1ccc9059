pub mod embeddings;
pub mod jobs;
pub mod memory_index;
pub mod pipeline;
pub mod prompt;
pub mod query;
pub mod retrieval;
pub mod vector_store;
