pub mod chunker;
pub mod extractor;
