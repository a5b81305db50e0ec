use std::sync::OnceLock;

use regex::Regex;

/// Maximum length for an ALLCAPS line to be promoted to a heading.
const HEADING_MAX_CHARS: usize = 60;
/// Window within which a repeated line counts as a running header/footer.
const REPEAT_WINDOW: usize = 5;

fn header_footer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(
            r"(?i)^(DIARIO\s+OFICIAL|BOLETÍN\s+OFICIAL|GACETA\s+OFICIAL|LEY\s+FEDERAL|LEY\s+GENERAL|REGLAMENTO|CÓDIGO|DECRETO|NOM-\d+|Página\s+\d+|\d+\s+de\s+\d+|(?:CAPÍTULO|TÍTULO|LIBRO|PARTE|SECCIÓN)\s+[IVXLCDM0-9]+|www\.|-+)\s*$",
        )
        .unwrap()
    })
}

fn numbered_item_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^\d+[.)]\s").unwrap()
    })
}

fn is_allcaps_heading(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.chars().count() >= HEADING_MAX_CHARS {
        return false;
    }
    let letters: Vec<char> = trimmed.chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

fn is_bullet(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("- ") || trimmed.starts_with("• ") || trimmed.starts_with("* ")
}

fn is_table_row(line: &str) -> bool {
    line.contains('|') && line.matches('|').count() >= 2
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c == '|' || c == '-' || c == ':' || c.is_whitespace())
}

/// Fallback plain-text-to-Markdown conversion: ALLCAPS lines become `##`
/// headings, bullet and numbered lists survive, and pipe-delimited runs are
/// wrapped as tables (injecting a header separator row when absent).
pub fn to_markdown(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut output: Vec<String> = Vec::with_capacity(lines.len());
    let mut index = 0;

    while index < lines.len() {
        let line = lines[index];
        let trimmed = line.trim();

        if trimmed.is_empty() {
            if !output.last().map(String::is_empty).unwrap_or(true) {
                output.push(String::new());
            }
            index += 1;
            continue;
        }

        if is_table_row(trimmed) {
            let mut table: Vec<String> = Vec::new();
            while index < lines.len() && is_table_row(lines[index].trim()) {
                table.push(normalize_table_row(lines[index].trim()));
                index += 1;
            }
            if table.len() >= 2 && !is_separator_row(&table[1]) {
                let columns = table[0].matches('|').count().saturating_sub(1).max(1);
                let separator = format!("|{}", " --- |".repeat(columns));
                table.insert(1, separator);
            }
            output.extend(table);
            output.push(String::new());
            continue;
        }

        if is_allcaps_heading(trimmed) {
            output.push(format!("## {trimmed}"));
        } else if is_bullet(trimmed) && !numbered_item_pattern().is_match(trimmed) {
            let body = trimmed
                .trim_start_matches(['-', '•', '*'])
                .trim_start();
            output.push(format!("- {body}"));
        } else {
            // Numbered list items and plain paragraphs pass through as-is.
            output.push(trimmed.to_owned());
        }

        index += 1;
    }

    while output.last().map(String::is_empty).unwrap_or(false) {
        output.pop();
    }

    output.join("\n")
}

fn normalize_table_row(row: &str) -> String {
    let mut normalized = row.trim().to_owned();
    if !normalized.starts_with('|') {
        normalized.insert(0, '|');
    }
    if !normalized.ends_with('|') {
        normalized.push('|');
    }
    normalized
}

/// Strips running headers and footers from regulatory text: official-gazette
/// patterns, page counters, bare structure lines and title echoes, removed
/// when they repeat within a small window or sit at the document edges.
pub fn clean_headers_footers(content: &str, document_title: Option<&str>) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let short_title = document_title.map(|title| {
        title
            .split_whitespace()
            .take(3)
            .collect::<Vec<_>>()
            .join(" ")
    });

    let looks_like_noise = |line: &str| -> bool {
        if header_footer_pattern().is_match(line) {
            return true;
        }
        if let Some(title) = document_title {
            if line == title {
                return true;
            }
        }
        if let Some(short) = &short_title {
            if short.len() > 15 && line.contains(short.as_str()) {
                return true;
            }
        }
        false
    };

    let mut cleaned: Vec<&str> = Vec::with_capacity(lines.len());
    let mut at_beginning = true;

    for (index, line) in lines.iter().enumerate() {
        let stripped = line.trim();
        let is_noise = looks_like_noise(stripped);

        if at_beginning {
            if stripped.is_empty() || is_noise {
                continue;
            }
            at_beginning = false;
        }

        if is_noise {
            let window_start = index.saturating_sub(REPEAT_WINDOW);
            let window_end = (index + REPEAT_WINDOW + 1).min(lines.len());
            let repeated = (window_start..window_end)
                .filter(|other| *other != index)
                .any(|other| lines[other].trim() == stripped);
            let at_edge = index + 1 >= lines.len();
            if repeated || at_edge {
                continue;
            }
        }

        if stripped.is_empty() && cleaned.last().map(|last| last.trim().is_empty()).unwrap_or(false)
        {
            continue;
        }

        cleaned.push(line);
    }

    while cleaned.last().map(|line| line.trim().is_empty()).unwrap_or(false) {
        cleaned.pop();
    }

    cleaned.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allcaps_lines_become_headings() {
        let markdown = to_markdown("DISPOSICIONES GENERALES\nEl presente reglamento aplica.");
        assert!(markdown.starts_with("## DISPOSICIONES GENERALES"));
        assert!(markdown.contains("El presente reglamento aplica."));
    }

    #[test]
    fn long_allcaps_lines_stay_paragraphs() {
        let line = "ESTA LÍNEA EN MAYÚSCULAS ES DEMASIADO LARGA PARA SER TRATADA COMO UN TÍTULO DE SECCIÓN";
        let markdown = to_markdown(line);
        assert!(!markdown.contains("##"));
    }

    #[test]
    fn bullets_and_numbered_lists_survive() {
        let markdown = to_markdown("• primer punto\n- segundo punto\n1. tercero");
        assert!(markdown.contains("- primer punto"));
        assert!(markdown.contains("- segundo punto"));
        assert!(markdown.contains("1. tercero"));
    }

    #[test]
    fn pipe_runs_get_separator_row() {
        let markdown = to_markdown("Concepto | Plazo | Sanción\nOmisión | 30 días | Multa");
        let lines: Vec<&str> = markdown.lines().collect();
        assert!(lines[0].starts_with('|'));
        assert!(is_separator_row(lines[1]), "expected separator, got {}", lines[1]);
        assert!(lines[2].contains("Omisión"));
    }

    #[test]
    fn repeated_gazette_header_is_removed() {
        let content = "DIARIO OFICIAL\nArtículo 1.- Contenido real.\nMás contenido.\nDIARIO OFICIAL\nSigue el texto.";
        let cleaned = clean_headers_footers(content, None);
        assert!(!cleaned.contains("DIARIO OFICIAL"));
        assert!(cleaned.contains("Artículo 1.- Contenido real."));
        assert!(cleaned.contains("Sigue el texto."));
    }

    #[test]
    fn page_counters_at_edges_are_removed() {
        let content = "Página 1\nTexto normativo.\n3 de 10";
        let cleaned = clean_headers_footers(content, None);
        assert_eq!(cleaned, "Texto normativo.");
    }

    #[test]
    fn title_echo_is_removed_when_repeated() {
        let title = "Reglamento de la Ley de Datos";
        let content = format!("{title}\nArtículo 1.- Texto.\n{title}\nArtículo 2.- Más texto.");
        let cleaned = clean_headers_footers(&content, Some(title));
        assert!(!cleaned.contains(title));
        assert!(cleaned.contains("Artículo 2.- Más texto."));
    }
}
