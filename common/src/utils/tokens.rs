use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(err) => {
                warn!(error = %err, "Failed to load cl100k tokenizer; falling back to char estimate");
                None
            }
        })
        .as_ref()
}

/// Counts BPE tokens with the `cl100k_base` encoding the retrieval budget
/// is defined against. Falls back to a chars/4 estimate if the encoder is
/// unavailable.
pub fn count_tokens(text: &str) -> usize {
    match encoder() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.chars().count() / 4,
    }
}

/// Truncates `text` to at most `max_tokens` tokens, preserving token
/// boundaries.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if max_tokens == 0 {
        return String::new();
    }

    match encoder() {
        Some(bpe) => {
            let tokens = bpe.encode_ordinary(text);
            if tokens.len() <= max_tokens {
                return text.to_owned();
            }
            let kept = tokens.into_iter().take(max_tokens).collect::<Vec<_>>();
            bpe.decode(kept)
                .unwrap_or_else(|_| text.chars().take(max_tokens * 4).collect())
        }
        None => text.chars().take(max_tokens * 4).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_tokens_for_plain_text() {
        let count = count_tokens("El Artículo 3 regula el tratamiento de datos personales.");
        assert!(count > 5, "expected a non-trivial token count, got {count}");
    }

    #[test]
    fn empty_text_counts_zero() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn truncation_respects_budget() {
        let text = "palabra ".repeat(500);
        let truncated = truncate_to_tokens(&text, 50);
        assert!(count_tokens(&truncated) <= 50);
        assert!(truncated.len() < text.len());
    }

    #[test]
    fn truncation_is_identity_under_budget() {
        let text = "Texto corto de prueba";
        assert_eq!(truncate_to_tokens(text, 1000), text);
    }
}
