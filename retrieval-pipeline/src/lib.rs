pub mod bm25;
pub mod cache;
pub mod pipeline;
pub mod query_analysis;
pub mod reranker;

use std::collections::HashMap;

use sha2::{Digest, Sha256};

pub use pipeline::{HybridRetriever, RetrievalConfig};
pub use query_analysis::{Complexity, Entity, Intent, Keyword, QueryInfo, QueryUnderstanding};

/// Marker returned when the query embedding came back as the zero sentinel
/// and retrieval was short-circuited.
pub const NO_RESULTS_MARKER: &str =
    "No se encontró documentación relevante para la consulta.";

/// Per-request retrieval state. Each user request starts with a fresh
/// instance; results are memoized under an 8-hex query fingerprint so a
/// repeated tool invocation within one request returns the same context.
#[derive(Debug, Default)]
pub struct RequestState {
    executed: HashMap<String, String>,
}

impl RequestState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fingerprint(query: &str) -> String {
        let digest = Sha256::digest(query.as_bytes());
        digest
            .iter()
            .take(4)
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<&String> {
        self.executed.get(fingerprint)
    }

    pub fn record(&mut self, fingerprint: String, context: String) {
        self.executed.insert(fingerprint, context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_eight_hex_chars() {
        let fp = RequestState::fingerprint("¿Qué es el GDPR?");
        assert_eq!(fp.len(), 8);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_stable_and_query_sensitive() {
        assert_eq!(
            RequestState::fingerprint("consulta"),
            RequestState::fingerprint("consulta")
        );
        assert_ne!(
            RequestState::fingerprint("consulta"),
            RequestState::fingerprint("otra consulta")
        );
    }

    #[test]
    fn state_memoizes_results() {
        let mut state = RequestState::new();
        let fp = RequestState::fingerprint("consulta");
        assert!(state.lookup(&fp).is_none());

        state.record(fp.clone(), "contexto".into());
        assert_eq!(state.lookup(&fp).map(String::as_str), Some("contexto"));
    }
}
