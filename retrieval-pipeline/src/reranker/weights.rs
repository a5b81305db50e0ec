/// Signal weights for the hybrid rerank combination. Adapted per query
/// before fusion; always renormalized to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalWeights {
    pub bm25: f32,
    pub cosine: f32,
    pub llm: f32,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            bm25: 0.3,
            cosine: 0.3,
            llm: 0.4,
        }
    }
}

impl SignalWeights {
    pub fn sum(&self) -> f32 {
        self.bm25 + self.cosine + self.llm
    }

    fn renormalize(mut self) -> Self {
        let total = self.sum();
        if total > 0.0 && (total - 1.0).abs() > f32::EPSILON {
            self.bm25 /= total;
            self.cosine /= total;
            self.llm /= total;
        }
        self
    }
}

const SPECIFIC_ARTICLE_TERMS: &[&str] = &[
    "artículo", "art.", "art ", "inciso", "fracción", "párrafo", "capítulo", "cap.", "cap ",
    "título", "sección", "anexo",
];

const INTERPRETATION_TERMS: &[&str] = &[
    "qué significa",
    "cómo interpretar",
    "qué implica",
    "alcance de",
    "criterio",
    "interpretación",
    "análisis",
    "opinión",
    "considera",
    "aplicable",
    "aplica",
    "abarca",
    "incluye",
    "comprende",
];

const FINANCIAL_TERMS: &[&str] = &[
    "financiero", "bancario", "bursátil", "seguros", "fintech", "tarifa", "comisión",
    "interchange", "adquirente", "emisor", "transacción", "lavado", "prevención", "cnbv",
    "banxico", "condusef", "shcp",
];

const TAX_TERMS: &[&str] = &[
    "fiscal", "tributario", "impuesto", "deducción", "isr", "iva", "ieps", "sat", "cff",
    "lisr", "liva", "declaración",
];

const PRIVACY_TERMS: &[&str] = &[
    "privacidad", "protección", "datos", "personales", "inai", "avisos", "consentimiento",
    "transferencia", "arco", "gdpr",
];

const LEGAL_TECHNICAL_TERMS: &[&str] = &[
    "ley", "decreto", "reglamento", "resolución", "circular", "acuerdo", "código",
    "constitución", "convenio", "tratado", "norma", "normativa", "jurisprudencia",
    "sentencia", "dictamen", "precedente", "expediente", "cumplimiento", "infracción",
    "sanción", "multa", "auditoría", "supervisión", "autoridad", "regulador", "kyc", "aml",
];

const JURISDICTION_TERMS: &[&str] = &[
    "federal",
    "estatal",
    "local",
    "municipal",
    "cdmx",
    "ciudad de méxico",
    "estados unidos",
    "méxico",
    "europeo",
    "internacional",
    "nacional",
];

const TEMPORAL_TERMS: &[&str] = &[
    "2023", "2024", "2025", "actual", "vigente", "nuevo", "nueva", "reciente", "último",
    "actualizado", "modificación", "reforma", "derogado", "abrogado", "anterior", "previo",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Adapts the rerank weights to the query's character: exact-match-seeking
/// queries lean on BM25, interpretive queries lean on the LLM signal.
pub fn adjust_weights(query: &str, defaults: SignalWeights) -> SignalWeights {
    let lowered = query.to_lowercase();
    let word_count = query.split_whitespace().count();

    let seeks_article = contains_any(&lowered, SPECIFIC_ARTICLE_TERMS);
    let is_interpretation = contains_any(&lowered, INTERPRETATION_TERMS);
    let has_financial = contains_any(&lowered, FINANCIAL_TERMS);
    let has_tax = contains_any(&lowered, TAX_TERMS);
    let has_privacy = contains_any(&lowered, PRIVACY_TERMS);
    let has_legal_technical = contains_any(&lowered, LEGAL_TECHNICAL_TERMS);
    let has_jurisdiction = contains_any(&lowered, JURISDICTION_TERMS);
    let has_temporal = contains_any(&lowered, TEMPORAL_TERMS);

    let mut weights = defaults;

    if seeks_article {
        weights = SignalWeights {
            bm25: 0.50,
            cosine: 0.25,
            llm: 0.25,
        };
    } else if is_interpretation {
        weights = SignalWeights {
            bm25: 0.20,
            cosine: 0.30,
            llm: 0.50,
        };
    } else if has_financial || has_tax || has_privacy {
        weights = SignalWeights {
            bm25: 0.40,
            cosine: 0.30,
            llm: 0.30,
        };
    } else if has_legal_technical {
        weights = SignalWeights {
            bm25: 0.35,
            cosine: 0.35,
            llm: 0.30,
        };
    } else if word_count <= 3 {
        weights = SignalWeights {
            bm25: 0.25,
            cosine: 0.30,
            llm: 0.45,
        };
    } else if word_count >= 20 {
        weights = SignalWeights {
            bm25: 0.20,
            cosine: 0.25,
            llm: 0.55,
        };
    }

    if has_temporal {
        weights.bm25 = (weights.bm25 - 0.10).max(0.15);
        weights.llm = (weights.llm + 0.10).min(0.60);
    }

    if has_jurisdiction {
        weights.bm25 = (weights.bm25 + 0.05).min(0.50);
        weights.cosine = (weights.cosine - 0.05).max(0.20);
    }

    if has_financial || has_tax {
        weights.bm25 = (weights.bm25 + 0.05).min(0.55);
    }

    weights.renormalize()
}

/// Min-max normalization with a log transform that widens meaningful gaps.
/// A constant input maps to all zeros (if zero) or all ones.
pub fn smart_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let first = scores[0];
    if scores.iter().all(|score| (*score - first).abs() < f32::EPSILON) {
        return if first == 0.0 {
            vec![0.0; scores.len()]
        } else {
            vec![1.0; scores.len()]
        };
    }

    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if range <= 0.0 {
        return vec![0.0; scores.len()];
    }

    let normalized: Vec<f32> = scores.iter().map(|score| (score - min) / range).collect();
    let logged: Vec<f32> = normalized.iter().map(|value| (value + 0.1).ln_1p()).collect();

    let log_min = logged.iter().copied().fold(f32::INFINITY, f32::min);
    let log_max = logged.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_range = log_max - log_min;
    if log_range > 0.0 {
        logged.iter().map(|value| (value - log_min) / log_range).collect()
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sums_to_one(weights: SignalWeights) {
        assert!(
            (weights.sum() - 1.0).abs() < 1e-6,
            "weights must sum to 1, got {weights:?}"
        );
    }

    #[test]
    fn article_queries_favor_bm25() {
        let weights = adjust_weights(
            "Qué dice el Artículo 3 de la LFPDPPP",
            SignalWeights::default(),
        );
        assert!((weights.bm25 - 0.50).abs() < 0.02);
        assert_sums_to_one(weights);
    }

    #[test]
    fn interpretive_queries_favor_llm() {
        let weights = adjust_weights(
            "Qué implica el principio de minimización de datos para un PISP",
            SignalWeights::default(),
        );
        assert!((weights.llm - 0.50).abs() < 1e-6);
        assert!((weights.bm25 - 0.20).abs() < 1e-6);
        assert_sums_to_one(weights);
    }

    #[test]
    fn short_queries_lean_on_llm() {
        let weights = adjust_weights("riesgo cambiario", SignalWeights::default());
        assert!(weights.llm > weights.bm25);
        assert_sums_to_one(weights);
    }

    #[test]
    fn temporal_reference_shifts_toward_llm() {
        let base = adjust_weights("obligaciones de los sujetos obligados", SignalWeights::default());
        let temporal = adjust_weights(
            "obligaciones vigentes de los sujetos obligados",
            SignalWeights::default(),
        );
        assert!(temporal.llm >= base.llm);
        assert_sums_to_one(temporal);
    }

    #[test]
    fn every_branch_renormalizes() {
        for query in [
            "artículo 12 fracción II",
            "qué significa interés legítimo",
            "comisión interchange adquirente",
            "sanción por incumplimiento de la norma",
            "gdpr",
            "una consulta extremadamente larga que describe con mucho detalle la necesidad de \
             revisar todos los requisitos normativos aplicables a una entidad financiera",
        ] {
            assert_sums_to_one(adjust_weights(query, SignalWeights::default()));
        }
    }

    #[test]
    fn normalize_outputs_stay_in_unit_interval() {
        let normalized = smart_normalize(&[3.0, 1.0, 7.5, 0.0, 2.2]);
        assert!(normalized.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(normalized.iter().any(|v| *v == 0.0));
        assert!(normalized.iter().any(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn normalize_constant_vectors() {
        assert_eq!(smart_normalize(&[0.0, 0.0, 0.0]), vec![0.0, 0.0, 0.0]);
        assert_eq!(smart_normalize(&[4.2, 4.2]), vec![1.0, 1.0]);
        assert!(smart_normalize(&[]).is_empty());
    }

    #[test]
    fn normalize_preserves_order() {
        let normalized = smart_normalize(&[1.0, 5.0, 3.0]);
        assert!(normalized[1] > normalized[2]);
        assert!(normalized[2] > normalized[0]);
    }
}
