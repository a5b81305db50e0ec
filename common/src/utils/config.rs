use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_model_advanced")]
    pub llm_model_advanced: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    /// Chunks table the retrieval and ingest pipelines operate on.
    /// The deployments this replaces used one table per jurisdiction.
    #[serde(default = "default_corpus")]
    pub corpus: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
    #[serde(default = "default_pending_chunks_dir")]
    pub pending_chunks_dir: String,
    #[serde(default)]
    pub report_template_path: Option<String>,
    #[serde(default = "default_max_total_tokens")]
    pub max_total_tokens: usize,
    #[serde(default = "default_max_chunks_returned")]
    pub max_chunks_returned: usize,
    #[serde(default = "default_max_chunks_for_reranking")]
    pub max_chunks_for_reranking: usize,
    #[serde(default = "default_max_chunks_to_keep_normal")]
    pub max_chunks_to_keep_normal: usize,
    #[serde(default = "default_max_chunks_to_keep_reports")]
    pub max_chunks_to_keep_reports: usize,
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_overlap_size")]
    pub overlap_size: usize,
    #[serde(default = "default_rpm_limit")]
    pub openai_rpm_limit: usize,
    #[serde(default = "default_process_batch_size")]
    pub process_batch_size: usize,
    #[serde(default = "default_max_process_workers")]
    pub max_process_workers: usize,
    #[serde(default = "default_max_concurrent_documents")]
    pub max_concurrent_documents: usize,
    #[serde(default)]
    pub allow_article_subdivision: bool,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_llm_model_advanced() -> String {
    "gpt-4".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_corpus() -> String {
    "pd_peru".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_checkpoint_dir() -> String {
    "./pipeline_checkpoints".to_string()
}

fn default_pending_chunks_dir() -> String {
    "./pending_chunks".to_string()
}

fn default_max_total_tokens() -> usize {
    100_000
}

fn default_max_chunks_returned() -> usize {
    30
}

fn default_max_chunks_for_reranking() -> usize {
    15
}

fn default_max_chunks_to_keep_normal() -> usize {
    8
}

fn default_max_chunks_to_keep_reports() -> usize {
    12
}

fn default_chunk_size() -> usize {
    8000
}

fn default_min_chunk_size() -> usize {
    200
}

fn default_overlap_size() -> usize {
    75
}

fn default_rpm_limit() -> usize {
    450
}

fn default_process_batch_size() -> usize {
    5
}

fn default_max_process_workers() -> usize {
    5
}

fn default_max_concurrent_documents() -> usize {
    2
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: "test-key".into(),
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "test_ns".into(),
            surrealdb_database: "test_db".into(),
            openai_base_url: default_base_url(),
            llm_model: default_llm_model(),
            llm_model_advanced: default_llm_model_advanced(),
            embedding_model: default_embedding_model(),
            vision_model: default_vision_model(),
            embedding_dimensions: default_embedding_dimensions(),
            corpus: default_corpus(),
            data_dir: default_data_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            pending_chunks_dir: default_pending_chunks_dir(),
            report_template_path: None,
            max_total_tokens: default_max_total_tokens(),
            max_chunks_returned: default_max_chunks_returned(),
            max_chunks_for_reranking: default_max_chunks_for_reranking(),
            max_chunks_to_keep_normal: default_max_chunks_to_keep_normal(),
            max_chunks_to_keep_reports: default_max_chunks_to_keep_reports(),
            default_chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            overlap_size: default_overlap_size(),
            openai_rpm_limit: default_rpm_limit(),
            process_batch_size: default_process_batch_size(),
            max_process_workers: default_max_process_workers(),
            max_concurrent_documents: default_max_concurrent_documents(),
            allow_article_subdivision: false,
        }
    }
}
