pub mod bootstrap;
pub mod catalog;
pub mod error;
pub mod indexer;
pub mod llm;
pub mod models;
pub mod rag;
pub mod server;
pub mod settings;
pub mod storage;
