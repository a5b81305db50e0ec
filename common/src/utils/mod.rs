pub mod config;
pub mod embedding;
pub mod llm;
pub mod rate_limit;
pub mod tokens;
