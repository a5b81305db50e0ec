use std::collections::HashMap;

/// Okapi BM25 over an in-process batch of tokenized documents. The lexical
/// search builds one of these per request over the vigente-filtered corpus;
/// the reranker builds one over its candidate set.
const K1: f32 = 1.5;
const B: f32 = 0.75;
/// Floor applied to negative IDF values, as a fraction of the average IDF.
const EPSILON: f32 = 0.25;

/// Lowercased word tokenizer shared by the index and its queries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

pub struct Bm25Index {
    doc_term_freqs: Vec<HashMap<String, usize>>,
    doc_lengths: Vec<f32>,
    avg_doc_length: f32,
    idf: HashMap<String, f32>,
}

impl Bm25Index {
    pub fn new(corpus: &[Vec<String>]) -> Self {
        let doc_count = corpus.len();
        let mut doc_term_freqs = Vec::with_capacity(doc_count);
        let mut doc_lengths = Vec::with_capacity(doc_count);
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for tokens in corpus {
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            doc_lengths.push(tokens.len() as f32);
            doc_term_freqs.push(freqs);
        }

        let avg_doc_length = if doc_count == 0 {
            0.0
        } else {
            doc_lengths.iter().sum::<f32>() / doc_count as f32
        };

        // Okapi IDF with the negative-value floor from the reference
        // implementation: terms present in most documents get a small
        // positive epsilon instead of a negative weight.
        let mut idf: HashMap<String, f32> = HashMap::new();
        let mut idf_sum = 0.0f32;
        let mut negative_terms = Vec::new();
        for (term, df) in &doc_freq {
            let value =
                ((doc_count as f32 - *df as f32 + 0.5) / (*df as f32 + 0.5)).ln();
            idf_sum += value;
            if value < 0.0 {
                negative_terms.push(term.clone());
            }
            idf.insert(term.clone(), value);
        }
        if !idf.is_empty() {
            let average_idf = idf_sum / idf.len() as f32;
            let floor = EPSILON * average_idf.abs();
            for term in negative_terms {
                idf.insert(term, floor);
            }
        }

        Self {
            doc_term_freqs,
            doc_lengths,
            avg_doc_length,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_term_freqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_term_freqs.is_empty()
    }

    /// BM25 score of the query against every document in the batch.
    pub fn scores(&self, query_tokens: &[String]) -> Vec<f32> {
        let mut scores = vec![0.0f32; self.doc_term_freqs.len()];
        if self.avg_doc_length == 0.0 {
            return scores;
        }

        for token in query_tokens {
            let Some(idf) = self.idf.get(token) else {
                continue;
            };
            for (index, freqs) in self.doc_term_freqs.iter().enumerate() {
                let tf = freqs.get(token).copied().unwrap_or(0) as f32;
                if tf == 0.0 {
                    continue;
                }
                let norm =
                    1.0 - B + B * (self.doc_lengths[index] / self.avg_doc_length);
                scores[index] += idf * (tf * (K1 + 1.0)) / (tf + K1 * norm);
            }
        }

        scores
    }

    /// Indices of the `take` best-scoring documents, descending, excluding
    /// zero scores.
    pub fn top_indices(&self, query_tokens: &[String], take: usize) -> Vec<usize> {
        let scores = self.scores(query_tokens);
        let mut ranked: Vec<(usize, f32)> = scores
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.into_iter().take(take).map(|(index, _)| index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<Vec<String>> {
        vec![
            tokenize("el tratamiento de datos personales requiere consentimiento"),
            tokenize("las entidades financieras reportan liquidez al supervisor"),
            tokenize("los datos personales sensibles exigen proteccion reforzada"),
        ]
    }

    #[test]
    fn tokenizer_lowercases_and_splits_punctuation() {
        let tokens = tokenize("Artículo 3.- Datos Personales; (ver anexo)");
        assert!(tokens.contains(&"artículo".to_string()));
        assert!(tokens.contains(&"3".to_string()));
        assert!(tokens.contains(&"datos".to_string()));
        assert!(!tokens.iter().any(|t| t.contains('.')));
    }

    #[test]
    fn relevant_documents_score_higher() {
        let index = Bm25Index::new(&corpus());
        let scores = index.scores(&tokenize("datos personales"));

        assert!(scores[0] > scores[1]);
        assert!(scores[2] > scores[1]);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn top_indices_excludes_zero_scores() {
        let index = Bm25Index::new(&corpus());
        let top = index.top_indices(&tokenize("liquidez"), 10);
        assert_eq!(top, vec![1]);
    }

    #[test]
    fn empty_corpus_scores_nothing() {
        let index = Bm25Index::new(&[]);
        assert!(index.is_empty());
        assert!(index.scores(&tokenize("datos")).is_empty());
    }

    #[test]
    fn unknown_terms_score_zero() {
        let index = Bm25Index::new(&corpus());
        let scores = index.scores(&tokenize("inexistente"));
        assert!(scores.iter().all(|score| *score == 0.0));
    }
}
