use std::collections::HashMap;
use std::sync::Arc;

use common::{error::AppError, utils::llm::LlmClient};
use tracing::{debug, info, warn};

use crate::{
    splitter::{split_paragraphs, split_sentences, SplitterConfig},
    types::SplitChunk,
};

/// Paragraph embedding batch size.
const EMBED_BATCH: usize = 20;
/// Running-size multiplier that forces a chunk break inside a cluster.
const BREAK_FACTOR: f32 = 1.3;
/// Composite-score penalty for clusters far below the target size.
const SMALL_CLUSTER_PENALTY: f32 = 0.3;
/// Composite-score penalty for clusters far above the target size.
const LARGE_CLUSTER_PENALTY: f32 = 0.2;

const CONCLUSION_CUES: &[&str] = &[
    "por tanto",
    "por lo tanto",
    "en conclusión",
    "en resumen",
    "finalmente",
];

const TRANSITION_CUES: &[&str] = &[
    "sin embargo",
    "por otro lado",
    "no obstante",
    "en cambio",
    "además",
];

/// Splits non-regulatory text by embedding paragraphs and clustering them
/// hierarchically, then building size-bounded chunks inside each cluster.
pub async fn semantic_split(
    text: &str,
    config: &SplitterConfig,
    llm: &Arc<LlmClient>,
) -> Result<Vec<SplitChunk>, AppError> {
    let paragraphs = split_paragraphs(text);
    if paragraphs.is_empty() {
        return Ok(Vec::new());
    }

    // Short documents skip clustering entirely.
    if text.chars().count() < 2 * config.chunk_size {
        debug!("Document under clustering threshold; using simple split");
        return Ok(simple_split(&paragraphs, config));
    }

    let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(paragraphs.len());
    for batch in paragraphs.chunks(EMBED_BATCH) {
        let vectors = llm.embed_batch(batch.to_vec()).await?;
        embeddings.extend(vectors);
    }

    let total_len: usize = paragraphs.iter().map(|p| p.chars().count()).sum();
    let target_clusters = (total_len / config.chunk_size).max(1);
    let k_max = target_clusters.min(paragraphs.len() / 3);

    let assignments = if k_max < 2 {
        vec![0; paragraphs.len()]
    } else {
        let (k, assignments) =
            choose_clustering(&embeddings, &paragraphs, config.chunk_size, 2, k_max);
        info!(k, paragraphs = paragraphs.len(), "Selected cluster count");
        assignments
    };

    let assignments =
        consolidate_small_clusters(assignments, &paragraphs, config.min_chunk_size);

    Ok(build_cluster_chunks(&paragraphs, &assignments, config))
}

fn simple_split(paragraphs: &[String], config: &SplitterConfig) -> Vec<SplitChunk> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs {
        if !current.is_empty()
            && current.chars().count() + paragraph.chars().count() > config.chunk_size
        {
            chunks.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            current = paragraph.clone();
        } else {
            current.push_str("\n\n");
            current.push_str(paragraph);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, text)| SplitChunk {
            text,
            cluster_id: index as i64,
            cluster_size: total,
            has_overlap: false,
            article_number: None,
            article_title: None,
            is_subdivision: false,
            clustering_method: "simple_split".into(),
            hierarchy: Vec::new(),
        })
        .collect()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

/// Agglomerative clustering with Ward linkage (Lance-Williams update over
/// squared Euclidean distances). Returns compact labels for `k` clusters.
pub fn agglomerative_ward(embeddings: &[Vec<f32>], k: usize) -> Vec<usize> {
    let n = embeddings.len();
    if n == 0 {
        return Vec::new();
    }
    let k = k.clamp(1, n);

    // Active cluster bookkeeping: members, sizes and pairwise distances.
    let mut members: Vec<Option<Vec<usize>>> = (0..n).map(|i| Some(vec![i])).collect();
    let mut sizes: Vec<usize> = vec![1; n];
    let mut distances: Vec<Vec<f32>> = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = squared_distance(&embeddings[i], &embeddings[j]);
            distances[i][j] = d;
            distances[j][i] = d;
        }
    }

    let mut active = n;
    while active > k {
        // Find the closest active pair.
        let mut best = (0usize, 0usize, f32::INFINITY);
        for i in 0..n {
            if members[i].is_none() {
                continue;
            }
            for j in (i + 1)..n {
                if members[j].is_none() {
                    continue;
                }
                if distances[i][j] < best.2 {
                    best = (i, j, distances[i][j]);
                }
            }
        }
        let (i, j, _) = best;

        // Merge j into i with the Ward Lance-Williams update.
        let (n_i, n_j) = (sizes[i] as f32, sizes[j] as f32);
        for target in 0..n {
            if target == i || target == j || members[target].is_none() {
                continue;
            }
            let n_k = sizes[target] as f32;
            let updated = ((n_i + n_k) * distances[i][target]
                + (n_j + n_k) * distances[j][target]
                - n_k * distances[i][j])
                / (n_i + n_j + n_k);
            distances[i][target] = updated;
            distances[target][i] = updated;
        }

        let merged = members[j].take().unwrap_or_default();
        if let Some(cluster) = members[i].as_mut() {
            cluster.extend(merged);
        }
        sizes[i] += sizes[j];
        active -= 1;
    }

    // Compact labels in first-member order.
    let mut labels = vec![0usize; n];
    let mut next_label = 0usize;
    for cluster in members.into_iter().flatten() {
        for member in cluster {
            labels[member] = next_label;
        }
        next_label += 1;
    }
    labels
}

/// Mean silhouette coefficient over Euclidean distances; singleton clusters
/// contribute 0.
pub fn silhouette_score(embeddings: &[Vec<f32>], assignments: &[usize]) -> f32 {
    let n = embeddings.len();
    if n < 2 {
        return 0.0;
    }

    let cluster_count = assignments.iter().max().map(|max| max + 1).unwrap_or(0);
    if cluster_count < 2 {
        return 0.0;
    }

    let mut total = 0.0f32;
    for i in 0..n {
        let own = assignments[i];
        let mut intra_sum = 0.0f32;
        let mut intra_count = 0usize;
        let mut inter: HashMap<usize, (f32, usize)> = HashMap::new();

        for j in 0..n {
            if i == j {
                continue;
            }
            let distance = squared_distance(&embeddings[i], &embeddings[j]).sqrt();
            if assignments[j] == own {
                intra_sum += distance;
                intra_count += 1;
            } else {
                let entry = inter.entry(assignments[j]).or_insert((0.0, 0));
                entry.0 += distance;
                entry.1 += 1;
            }
        }

        if intra_count == 0 || inter.is_empty() {
            continue;
        }

        let a = intra_sum / intra_count as f32;
        let b = inter
            .values()
            .map(|(sum, count)| sum / *count as f32)
            .fold(f32::INFINITY, f32::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }

    total / n as f32
}

/// Picks `k` by maximizing silhouette minus cluster-size penalties.
fn choose_clustering(
    embeddings: &[Vec<f32>],
    paragraphs: &[String],
    target_size: usize,
    k_min: usize,
    k_max: usize,
) -> (usize, Vec<usize>) {
    let mut best: Option<(usize, Vec<usize>, f32)> = None;

    for k in k_min..=k_max {
        let assignments = agglomerative_ward(embeddings, k);
        let composite = composite_score(embeddings, paragraphs, &assignments, target_size);
        debug!(k, composite, "Evaluated clustering candidate");

        let replace = best
            .as_ref()
            .map(|(_, _, best_score)| composite > *best_score)
            .unwrap_or(true);
        if replace {
            best = Some((k, assignments, composite));
        }
    }

    best.map(|(k, assignments, _)| (k, assignments))
        .unwrap_or_else(|| (1, vec![0; embeddings.len()]))
}

fn composite_score(
    embeddings: &[Vec<f32>],
    paragraphs: &[String],
    assignments: &[usize],
    target_size: usize,
) -> f32 {
    let mut score = silhouette_score(embeddings, assignments);

    let sizes = cluster_text_sizes(paragraphs, assignments);
    if sizes
        .values()
        .any(|size| (*size as f32) < 0.3 * target_size as f32)
    {
        score -= SMALL_CLUSTER_PENALTY;
    }
    if sizes
        .values()
        .any(|size| (*size as f32) > 2.0 * target_size as f32)
    {
        score -= LARGE_CLUSTER_PENALTY;
    }

    score
}

fn cluster_text_sizes(paragraphs: &[String], assignments: &[usize]) -> HashMap<usize, usize> {
    let mut sizes: HashMap<usize, usize> = HashMap::new();
    for (paragraph, cluster) in paragraphs.iter().zip(assignments.iter()) {
        *sizes.entry(*cluster).or_insert(0) += paragraph.chars().count();
    }
    sizes
}

/// Merges clusters whose total text is below the minimum chunk size into
/// the nearest cluster by average paragraph index.
pub fn consolidate_small_clusters(
    mut assignments: Vec<usize>,
    paragraphs: &[String],
    min_chunk_size: usize,
) -> Vec<usize> {
    loop {
        let sizes = cluster_text_sizes(paragraphs, &assignments);
        if sizes.len() <= 1 {
            break;
        }

        let Some((small_cluster, _)) = sizes
            .iter()
            .filter(|(_, size)| **size < min_chunk_size)
            .min_by_key(|(_, size)| **size)
            .map(|(cluster, size)| (*cluster, *size))
        else {
            break;
        };

        let average_index = |cluster: usize| -> f32 {
            let indices: Vec<usize> = assignments
                .iter()
                .enumerate()
                .filter(|(_, c)| **c == cluster)
                .map(|(index, _)| index)
                .collect();
            if indices.is_empty() {
                return 0.0;
            }
            indices.iter().sum::<usize>() as f32 / indices.len() as f32
        };

        let small_average = average_index(small_cluster);
        let Some(nearest) = sizes
            .keys()
            .filter(|cluster| **cluster != small_cluster)
            .min_by(|a, b| {
                let da = (average_index(**a) - small_average).abs();
                let db = (average_index(**b) - small_average).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
        else {
            break;
        };

        for assignment in &mut assignments {
            if *assignment == small_cluster {
                *assignment = nearest;
            }
        }
        warn!(
            merged = small_cluster,
            into = nearest,
            "Consolidated undersized cluster"
        );
    }

    assignments
}

fn ends_with_conclusion_cue(paragraph: &str) -> bool {
    let lowered = paragraph.to_lowercase();
    let tail: String = lowered
        .chars()
        .rev()
        .take(80)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    CONCLUSION_CUES.iter().any(|cue| tail.contains(cue))
}

fn starts_with_transition_cue(paragraph: &str) -> bool {
    let lowered = paragraph.to_lowercase();
    TRANSITION_CUES
        .iter()
        .any(|cue| lowered.trim_start().starts_with(cue))
}

/// Sentence tail of a chunk, capped at `max_chars`, preserving sentence
/// boundaries. Used as inter-chunk overlap.
fn sentence_tail(text: &str, max_chars: usize) -> String {
    let sentences = split_sentences(text);
    let mut tail: Vec<&str> = Vec::new();
    let mut used = 0usize;

    for sentence in sentences.iter().rev() {
        let length = sentence.chars().count();
        if used + length > max_chars {
            break;
        }
        tail.push(sentence);
        used += length;
    }

    tail.reverse();
    tail.join(" ")
}

/// Builds chunks inside each cluster in document order, breaking on size or
/// on discourse cues, with a sentence-tail overlap between chunks.
pub fn build_cluster_chunks(
    paragraphs: &[String],
    assignments: &[usize],
    config: &SplitterConfig,
) -> Vec<SplitChunk> {
    // Clusters ordered by first paragraph appearance.
    let mut cluster_order: Vec<usize> = Vec::new();
    for cluster in assignments {
        if !cluster_order.contains(cluster) {
            cluster_order.push(*cluster);
        }
    }

    let break_size = (config.chunk_size as f32 * BREAK_FACTOR) as usize;
    let mut chunks = Vec::new();

    for (ordinal, &cluster) in cluster_order.iter().enumerate() {
        let cluster_paragraphs: Vec<&String> = paragraphs
            .iter()
            .zip(assignments.iter())
            .filter(|(_, assigned)| **assigned == cluster)
            .map(|(paragraph, _)| paragraph)
            .collect();

        let mut cluster_chunks: Vec<(String, bool)> = Vec::new();
        let mut current = String::new();
        let mut current_has_overlap = false;

        for (index, paragraph) in cluster_paragraphs.iter().enumerate() {
            let natural_break = index > 0
                && (ends_with_conclusion_cue(cluster_paragraphs[index - 1])
                    || starts_with_transition_cue(paragraph));
            let size_break = current.chars().count() > break_size;

            if !current.is_empty()
                && current.chars().count() >= config.min_chunk_size
                && (size_break || natural_break)
            {
                let overlap = sentence_tail(&current, config.overlap_size);
                cluster_chunks.push((std::mem::take(&mut current), current_has_overlap));
                if !overlap.is_empty() {
                    current = overlap;
                    current_has_overlap = true;
                } else {
                    current_has_overlap = false;
                }
            }

            if current.is_empty() {
                current = (*paragraph).clone();
            } else {
                current.push_str("\n\n");
                current.push_str(paragraph);
            }
        }

        if !current.trim().is_empty() {
            cluster_chunks.push((current, current_has_overlap));
        }

        let per_cluster = cluster_chunks.len();
        for (text, has_overlap) in cluster_chunks {
            chunks.push(SplitChunk {
                text,
                cluster_id: ordinal as i64,
                cluster_size: per_cluster,
                has_overlap,
                article_number: None,
                article_title: None,
                is_subdivision: false,
                clustering_method: "agglomerative_ward".into(),
                hierarchy: Vec::new(),
            });
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_embeddings() -> Vec<Vec<f32>> {
        vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![5.0, 5.0],
            vec![5.1, 5.0],
            vec![5.0, 5.1],
        ]
    }

    #[test]
    fn ward_separates_two_blobs() {
        let labels = agglomerative_ward(&blob_embeddings(), 2);
        assert_eq!(labels.len(), 6);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn ward_with_k_one_puts_everything_together() {
        let labels = agglomerative_ward(&blob_embeddings(), 1);
        assert!(labels.iter().all(|label| *label == 0));
    }

    #[test]
    fn silhouette_prefers_the_true_partition() {
        let embeddings = blob_embeddings();
        let good = vec![0, 0, 0, 1, 1, 1];
        let bad = vec![0, 1, 0, 1, 0, 1];

        assert!(
            silhouette_score(&embeddings, &good) > silhouette_score(&embeddings, &bad)
        );
        assert!(silhouette_score(&embeddings, &good) > 0.8);
    }

    #[test]
    fn consolidation_merges_undersized_cluster() {
        let paragraphs = vec![
            "x".repeat(500),
            "y".repeat(500),
            "corto".to_string(),
        ];
        let assignments = vec![0, 0, 1];

        let merged = consolidate_small_clusters(assignments, &paragraphs, 200);
        assert!(merged.iter().all(|cluster| *cluster == 0));
    }

    #[test]
    fn cluster_chunks_break_on_size_with_overlap() {
        let paragraphs: Vec<String> = (0..6)
            .map(|i| format!("Párrafo {i}. {}", "contenido repetido. ".repeat(10)))
            .collect();
        let assignments = vec![0; paragraphs.len()];
        let config = SplitterConfig {
            chunk_size: 300,
            min_chunk_size: 100,
            overlap_size: 75,
            allow_article_subdivision: false,
        };

        let chunks = build_cluster_chunks(&paragraphs, &assignments, &config);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().skip(1).any(|chunk| chunk.has_overlap));
        assert!(chunks
            .iter()
            .all(|chunk| chunk.clustering_method == "agglomerative_ward"));
        let per_cluster = chunks.len();
        assert!(chunks.iter().all(|chunk| chunk.cluster_size == per_cluster));
    }

    #[test]
    fn transition_cue_forces_break() {
        let paragraphs = vec![
            format!("Introducción. {}", "texto. ".repeat(30)),
            format!("Sin embargo, el criterio cambia. {}", "texto. ".repeat(30)),
        ];
        let assignments = vec![0, 0];
        let config = SplitterConfig {
            chunk_size: 10_000,
            min_chunk_size: 50,
            overlap_size: 75,
            allow_article_subdivision: false,
        };

        let chunks = build_cluster_chunks(&paragraphs, &assignments, &config);
        assert_eq!(chunks.len(), 2, "transition cue should open a new chunk");
    }

    #[test]
    fn sentence_tail_respects_cap() {
        let text = "Primera oración corta. Segunda oración corta. Tercera oración corta.";
        let tail = sentence_tail(text, 50);
        assert!(tail.chars().count() <= 50);
        assert!(tail.contains("Tercera"));
    }

    #[tokio::test]
    async fn short_documents_use_simple_split() {
        let config = SplitterConfig {
            chunk_size: 10_000,
            min_chunk_size: 200,
            overlap_size: 75,
            allow_article_subdivision: false,
        };
        let llm = Arc::new(LlmClient::from_config(
            &common::utils::config::AppConfig::default(),
        ));

        let text = "Primer párrafo del informe.\n\nSegundo párrafo del informe.";
        let chunks = semantic_split(text, &config, &llm).await.expect("split");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].clustering_method, "simple_split");
        assert!(chunks[0].text.contains("Segundo párrafo"));
    }
}
