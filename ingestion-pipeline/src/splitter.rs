use std::sync::{Arc, OnceLock};

use common::{error::AppError, utils::config::AppConfig, utils::llm::LlmClient};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::{
    clustering,
    types::{DocumentMetadata, HierarchyEntry, SplitChunk},
    utils::markdown::clean_headers_footers,
};

/// Window of text inspected for regulatory markers.
const REGULATORY_SCAN_CHARS: usize = 10_000;
/// Marker matches required to treat an untyped document as regulatory.
const REGULATORY_MARKER_THRESHOLD: usize = 2;

const REGULATORY_TYPES: &[&str] = &[
    "ley",
    "reglamento",
    "decreto",
    "circular",
    "directiva",
    "norma",
    "código",
    "resolución",
    "acuerdo",
];

#[derive(Debug, Clone)]
pub struct SplitterConfig {
    pub chunk_size: usize,
    pub min_chunk_size: usize,
    pub overlap_size: usize,
    pub allow_article_subdivision: bool,
}

impl SplitterConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.default_chunk_size,
            min_chunk_size: config.min_chunk_size,
            overlap_size: config.overlap_size,
            allow_article_subdivision: config.allow_article_subdivision,
        }
    }
}

#[derive(Debug)]
struct Article {
    number: String,
    title: String,
    content: String,
    start: usize,
    hierarchy: Vec<HierarchyEntry>,
}

#[derive(Debug)]
struct StructureMarker {
    level: String,
    number: String,
    title: String,
    start: usize,
}

/// Post-split quality report; chunks are never dropped, only flagged.
#[derive(Debug, Default)]
pub struct SplitValidation {
    pub total_chunks: usize,
    pub empty_chunks: Vec<usize>,
    pub undersized_chunks: Vec<usize>,
    pub oversized_chunks: Vec<usize>,
}

impl SplitValidation {
    pub fn is_clean(&self) -> bool {
        self.empty_chunks.is_empty()
            && self.undersized_chunks.is_empty()
            && self.oversized_chunks.is_empty()
    }
}

fn regulatory_marker_patterns() -> &'static [Regex; 5] {
    static PATTERNS: OnceLock<[Regex; 5]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        [
            Regex::new(r"(?i)art(?:ículo|iculo|\.)\s+\d+").unwrap(),
            Regex::new(r"ARTÍCULO\s+\d+").unwrap(),
            Regex::new(r"(?i)(?:CAPÍTULO|TÍTULO|SECCIÓN)\s+[IVXLCDM]+").unwrap(),
            Regex::new(r"(?i)(?:LEY|REGLAMENTO|DECRETO|CÓDIGO)\s+(?:FEDERAL|GENERAL|DE)").unwrap(),
            Regex::new(r"(?i)Norma\s+\d+").unwrap(),
        ]
    })
}

fn article_main_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?im)^[ \t]*(Artículo\s+(\d+)°?\.-)[ \t]*([^\n]*)").unwrap()
    })
}

fn article_alt_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?im)^[ \t]*(Artículo\s+(\d+))[ \t]*\n+[ \t]*([^\n]+)").unwrap()
    })
}

fn article_broad_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?im)^[ \t]*(Artículo\s+(\d+)?\.?-?)[ \t]*([^\n]*)").unwrap()
    })
}

fn structure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?im)^[ \t]*(CAPÍTULO|TÍTULO|SECCIÓN)\s+([IVXLCDM]+|\d+)\.?\s*[-–—]?\s*([^\n]*)")
            .unwrap()
    })
}

fn document_title_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?im)^[ \t]*((?:LEY|CÓDIGO|REGLAMENTO|DECRETO)[^\n]{4,100})").unwrap()
    })
}

/// Splits extracted document text into ordered chunk records. Regulatory
/// documents split at article boundaries; everything else goes through the
/// semantic clustering path.
pub struct TextSplitter {
    config: SplitterConfig,
}

impl TextSplitter {
    pub fn new(config: SplitterConfig) -> Self {
        Self { config }
    }

    /// Whether the document should be split at article boundaries, decided
    /// by its declared type or by marker density near the start.
    pub fn is_regulatory_document(text: &str, metadata: Option<&DocumentMetadata>) -> bool {
        if let Some(doc_type) = metadata.and_then(|metadata| metadata.document_type.as_deref()) {
            let lowered = doc_type.to_lowercase();
            if REGULATORY_TYPES
                .iter()
                .any(|regulatory| lowered.contains(regulatory))
            {
                return true;
            }
        }

        let head: String = text.chars().take(REGULATORY_SCAN_CHARS).collect();
        let matches = regulatory_marker_patterns()
            .iter()
            .filter(|pattern| pattern.is_match(&head))
            .count();
        matches >= REGULATORY_MARKER_THRESHOLD
    }

    #[instrument(skip_all, fields(text_chars = text.chars().count()))]
    pub async fn split(
        &self,
        text: &str,
        metadata: Option<&DocumentMetadata>,
        llm: &Arc<LlmClient>,
    ) -> Result<Vec<SplitChunk>, AppError> {
        let chunks = if Self::is_regulatory_document(text, metadata) {
            info!("Splitting as regulatory document (article boundaries)");
            self.split_regulatory(text, metadata)
        } else {
            info!("Splitting as general document (semantic clustering)");
            clustering::semantic_split(text, &self.config, llm).await?
        };

        let validation = validate_chunks(&chunks, &self.config);
        if !validation.is_clean() {
            warn!(
                empty = validation.empty_chunks.len(),
                undersized = validation.undersized_chunks.len(),
                oversized = validation.oversized_chunks.len(),
                "Split produced irregular chunks; keeping them all"
            );
        }

        Ok(chunks)
    }

    fn split_regulatory(
        &self,
        text: &str,
        metadata: Option<&DocumentMetadata>,
    ) -> Vec<SplitChunk> {
        let mut articles = extract_articles(text);
        if articles.is_empty() {
            warn!("No articles found with any pattern; regulatory split yields nothing");
            return Vec::new();
        }

        let structures = extract_structures(text);
        for article in &mut articles {
            article.hierarchy = hierarchy_for(article.start, &structures);
        }

        let document_title = resolve_document_title(text, metadata);
        debug!(
            articles = articles.len(),
            structures = structures.len(),
            document_title = document_title.as_deref().unwrap_or("<none>"),
            "Article extraction complete"
        );

        let total_articles = articles.len();
        let mut chunks = Vec::with_capacity(total_articles);
        for (index, article) in articles.iter().enumerate() {
            if article.content.chars().count() > self.config.chunk_size
                && self.config.allow_article_subdivision
            {
                chunks.extend(self.subdivide_article(article, index));
            } else {
                let cleaned =
                    clean_headers_footers(&article.content, document_title.as_deref());
                chunks.push(SplitChunk {
                    text: cleaned.trim().to_owned(),
                    cluster_id: index as i64,
                    cluster_size: 1,
                    has_overlap: false,
                    article_number: Some(article.number.clone()),
                    article_title: Some(article.title.clone()),
                    is_subdivision: false,
                    clustering_method: "article_boundary".into(),
                    hierarchy: article.hierarchy.clone(),
                });
            }
        }

        for chunk in &mut chunks {
            chunk.cluster_size = total_articles;
        }

        chunks
    }

    /// Splits an oversized article at paragraph boundaries, naming the parts
    /// `<número>.<parte>`.
    fn subdivide_article(&self, article: &Article, article_index: usize) -> Vec<SplitChunk> {
        let paragraphs = split_paragraphs(&article.content);
        let paragraphs = if paragraphs.len() < 2 {
            split_sentences(&article.content)
        } else {
            paragraphs
        };

        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut part = 1usize;

        let mut emit = |text: &str, part: usize, chunks: &mut Vec<SplitChunk>| {
            chunks.push(SplitChunk {
                text: text.trim().to_owned(),
                cluster_id: article_index as i64,
                cluster_size: 1,
                has_overlap: false,
                article_number: Some(format!("{}.{part}", article.number)),
                article_title: Some(format!("{} (Parte {part})", article.title)),
                is_subdivision: true,
                clustering_method: "article_boundary".into(),
                hierarchy: article.hierarchy.clone(),
            });
        };

        for paragraph in paragraphs {
            let would_overflow =
                current.chars().count() + paragraph.chars().count() > self.config.chunk_size;
            if would_overflow && current.chars().count() >= self.config.min_chunk_size {
                emit(&current, part, &mut chunks);
                part += 1;
                current = paragraph;
            } else if current.is_empty() {
                current = paragraph;
            } else {
                current.push_str("\n\n");
                current.push_str(&paragraph);
            }
        }

        if !current.trim().is_empty() {
            emit(&current, part, &mut chunks);
        }

        chunks
    }
}

/// Finds article boundaries with progressively more permissive patterns.
fn extract_articles(text: &str) -> Vec<Article> {
    for (pattern, label) in [
        (article_main_pattern(), "main"),
        (article_alt_pattern(), "alternate"),
        (article_broad_pattern(), "broad"),
    ] {
        let mut starts: Vec<(String, usize, String)> = Vec::new();
        for (ordinal, captures) in pattern.captures_iter(text).enumerate() {
            let Some(marker) = captures.get(1) else {
                continue;
            };
            let number = captures
                .get(2)
                .map(|m| m.as_str().to_owned())
                .unwrap_or_else(|| (ordinal + 1).to_string());
            let title_part = captures
                .get(3)
                .map(|m| m.as_str().trim().to_owned())
                .unwrap_or_default();
            starts.push((number, marker.start(), title_part));
        }

        if starts.is_empty() {
            continue;
        }
        debug!(pattern = label, articles = starts.len(), "Article pattern matched");

        starts.sort_by_key(|(_, start, _)| *start);

        let mut articles = Vec::with_capacity(starts.len());
        for (index, (number, start, title_part)) in starts.iter().enumerate() {
            let end = starts
                .get(index + 1)
                .map(|(_, next_start, _)| *next_start)
                .unwrap_or(text.len());
            let content = text[*start..end].trim().to_owned();

            let title = if title_part.is_empty() {
                format!("Artículo {number}")
            } else {
                format!("Artículo {number}.- {title_part}")
            };

            articles.push(Article {
                number: number.clone(),
                title,
                content,
                start: *start,
                hierarchy: Vec::new(),
            });
        }

        return articles;
    }

    Vec::new()
}

fn extract_structures(text: &str) -> Vec<StructureMarker> {
    structure_pattern()
        .captures_iter(text)
        .filter_map(|captures| {
            let level = captures.get(1)?.as_str().to_uppercase();
            let number = captures.get(2)?.as_str().to_owned();
            let title = captures
                .get(3)
                .map(|m| m.as_str().trim().to_owned())
                .unwrap_or_default();
            let start = captures.get(1)?.start();
            Some(StructureMarker {
                level,
                number,
                title,
                start,
            })
        })
        .collect()
}

/// The hierarchy covering an article: the most recent marker of each type
/// that precedes it, latest-of-type winning.
fn hierarchy_for(article_start: usize, structures: &[StructureMarker]) -> Vec<HierarchyEntry> {
    let mut current: Vec<HierarchyEntry> = Vec::new();

    for structure in structures {
        if structure.start >= article_start {
            break;
        }
        let entry = HierarchyEntry {
            level: structure.level.clone(),
            number: structure.number.clone(),
            title: structure.title.clone(),
        };
        if let Some(existing) = current.iter_mut().find(|item| item.level == entry.level) {
            *existing = entry;
        } else {
            current.push(entry);
        }
    }

    current
}

fn resolve_document_title(text: &str, metadata: Option<&DocumentMetadata>) -> Option<String> {
    if let Some(title) = metadata.and_then(|metadata| metadata.document_title.clone()) {
        return Some(title);
    }

    let head: String = text.chars().take(2000).collect();
    document_title_pattern()
        .captures(&head)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim().to_owned())
}

pub(crate) fn split_paragraphs(text: &str) -> Vec<String> {
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();
    let pattern = BLANK_LINES.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\n{2,}").unwrap()
    });

    pattern
        .split(text)
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Sentence-boundary split: breaks after a period followed by whitespace.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        if ch == '.' && chars.peek().map(|next| next.is_whitespace()).unwrap_or(true) {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_owned());
            }
            current.clear();
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_owned());
    }

    sentences
}

fn validate_chunks(chunks: &[SplitChunk], config: &SplitterConfig) -> SplitValidation {
    let mut validation = SplitValidation {
        total_chunks: chunks.len(),
        ..SplitValidation::default()
    };

    for (index, chunk) in chunks.iter().enumerate() {
        let size = chunk.text.chars().count();
        if chunk.text.trim().is_empty() {
            validation.empty_chunks.push(index);
        } else if size < config.min_chunk_size {
            validation.undersized_chunks.push(index);
        } else if size > config.chunk_size * 3 {
            validation.oversized_chunks.push(index);
        }
    }

    validation
}
