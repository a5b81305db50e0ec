use std::{path::Path, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{error::AppError, utils::llm::LlmClient};
use futures::{stream, StreamExt};
use headless_chrome::{protocol::cdp::Page, Browser};
use lopdf::Document;
use tracing::{debug, warn};

use crate::types::ExtractedText;

/// Minimum usable length for the text-layer fast path.
const FAST_PATH_MIN_LEN: usize = 150;
const FAST_PATH_MIN_ASCII_RATIO: f64 = 0.7;
/// Minimum characters per page before the text layer counts as present.
const MIN_CHARS_PER_PAGE: usize = 50;
const MAX_VISION_PAGES: usize = 50;
const MAX_VISION_ATTEMPTS: usize = 2;
const VISION_CONCURRENCY: usize = 4;

const PAGE_MARKDOWN_PROMPT: &str = "Convierte esta página de un documento normativo a Markdown \
limpio. Conserva encabezados, listas, tablas y el orden de lectura original. No añadas \
comentarios ni envuelvas la respuesta en un bloque de código.";
const PAGE_MARKDOWN_PROMPT_RETRY: &str = "Debes transcribir la imagen de página adjunta a \
Markdown fiel. La imagen ya está incluida, no respondas que no puedes verla. Extrae todo el \
texto visible, incluidas tablas, sin envolver la respuesta en un bloque de código.";

/// Extracts PDF content: text-layer fast path first, page rasterization plus
/// vision transcription when the text layer is missing or too noisy.
pub async fn extract_pdf_content(
    file_path: &Path,
    llm: &Arc<LlmClient>,
) -> Result<ExtractedText, AppError> {
    let pdf_bytes = tokio::fs::read(file_path).await?;
    let page_numbers = load_page_numbers(pdf_bytes.clone()).await?;
    if page_numbers.is_empty() {
        return Err(AppError::Processing("PDF appears to have no pages".into()));
    }

    if let Some(text) = try_fast_path(pdf_bytes, page_numbers.len()).await? {
        return Ok(ExtractedText {
            content: text,
            page_count: page_numbers.len(),
            extraction_method: "text_layer".into(),
        });
    }

    if page_numbers.len() > MAX_VISION_PAGES {
        return Err(AppError::Processing(format!(
            "PDF has {} pages which exceeds the vision processing limit of {MAX_VISION_PAGES}",
            page_numbers.len()
        )));
    }

    let rendered = render_pdf_pages(file_path, &page_numbers).await?;
    let content = vision_markdown(rendered, llm).await?;

    Ok(ExtractedText {
        content,
        page_count: page_numbers.len(),
        extraction_method: "vision".into(),
    })
}

/// Text of the first pages, for the metadata extraction prompt. Uses the
/// text layer only; sparse layers yield whatever is there.
pub async fn first_pages_text(
    file_path: &Path,
    max_pages: usize,
    char_cap: usize,
) -> Result<String, AppError> {
    let pdf_bytes = tokio::fs::read(file_path).await?;
    let text = extract_text_layer(pdf_bytes).await?;

    // pdf-extract separates pages with form feeds when the document
    // provides them; fall back to the char cap otherwise.
    let by_pages: String = text
        .split('\u{c}')
        .take(max_pages)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(by_pages.chars().take(char_cap).collect())
}

/// Sends one image file straight through the vision model.
pub async fn extract_image_content(
    file_path: &Path,
    llm: &Arc<LlmClient>,
) -> Result<ExtractedText, AppError> {
    let bytes = tokio::fs::read(file_path).await?;
    let encoded = STANDARD.encode(&bytes);

    let content = transcribe_with_retry(llm, vec![encoded]).await?;
    Ok(ExtractedText {
        content,
        page_count: 1,
        extraction_method: "vision".into(),
    })
}

async fn extract_text_layer(pdf_bytes: Vec<u8>) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem(&pdf_bytes).map(|text| text.trim().to_owned())
    })
    .await?
    .map_err(|err| AppError::Processing(format!("Failed to extract text from PDF: {err}")))
}

/// Runs the text-layer extraction and validates the result with simple
/// heuristics. Returns `Ok(None)` when the layer is missing or too noisy.
async fn try_fast_path(
    pdf_bytes: Vec<u8>,
    page_count: usize,
) -> Result<Option<String>, AppError> {
    let extraction = extract_text_layer(pdf_bytes).await?;

    if extraction.is_empty()
        || extraction.chars().count() < MIN_CHARS_PER_PAGE * page_count
        || !looks_good_enough(&extraction)
    {
        return Ok(None);
    }

    Ok(Some(extraction))
}

async fn load_page_numbers(pdf_bytes: Vec<u8>) -> Result<Vec<u32>, AppError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<u32>, AppError> {
        let document = Document::load_mem(&pdf_bytes)
            .map_err(|err| AppError::Processing(format!("Failed to parse PDF: {err}")))?;
        let mut page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
        page_numbers.sort_unstable();
        Ok(page_numbers)
    })
    .await?
}

/// Heuristic that determines whether the fast-path text looks like
/// well-formed prose rather than extraction noise.
fn looks_good_enough(text: &str) -> bool {
    if text.len() < FAST_PATH_MIN_LEN {
        return false;
    }

    let total_chars = text.chars().count() as f64;
    if total_chars == 0.0 {
        return false;
    }

    let ascii_chars = text.chars().filter(|c| c.is_ascii()).count() as f64;
    if ascii_chars / total_chars < FAST_PATH_MIN_ASCII_RATIO {
        return false;
    }

    let letters = text.chars().filter(|c| c.is_alphabetic()).count() as f64;
    letters / total_chars > 0.3
}

/// Rasterizes the requested pages through the bundled Chrome PDF viewer.
async fn render_pdf_pages(file_path: &Path, pages: &[u32]) -> Result<Vec<Vec<u8>>, AppError> {
    let file_url = url::Url::from_file_path(file_path)
        .map_err(|_| AppError::Processing("Unable to construct PDF file URL".into()))?;
    let pages = pages.to_vec();

    tokio::task::spawn_blocking(move || -> Result<Vec<Vec<u8>>, AppError> {
        let browser = create_browser()?;
        let tab = browser
            .new_tab()
            .map_err(|err| AppError::Processing(format!("Failed to create Chrome tab: {err}")))?;
        tab.set_default_timeout(Duration::from_secs(10));

        let mut captures = Vec::with_capacity(pages.len());
        for page in &pages {
            let target = format!("{file_url}#page={page}&toolbar=0&statusbar=0&zoom=page-fit");
            tab.navigate_to(&target)
                .map_err(|err| {
                    AppError::Processing(format!("Failed to navigate to PDF page: {err}"))
                })?
                .wait_until_navigated()
                .map_err(|err| {
                    AppError::Processing(format!("Navigation to PDF page failed: {err}"))
                })?;

            tab.wait_for_element("embed, canvas, body").map_err(|err| {
                AppError::Processing(format!("Timed out waiting for PDF render: {err}"))
            })?;
            std::thread::sleep(Duration::from_millis(350));

            let png = tab
                .capture_screenshot(
                    Page::CaptureScreenshotFormatOption::Png,
                    None,
                    None,
                    true,
                )
                .map_err(|err| {
                    AppError::Processing(format!("Failed to capture PDF page: {err}"))
                })?;

            debug!(page, bytes = png.len(), "Captured PDF page screenshot");
            captures.push(png);
        }

        Ok(captures)
    })
    .await?
}

fn create_browser() -> Result<Browser, AppError> {
    #[cfg(feature = "docker")]
    {
        let options = headless_chrome::LaunchOptionsBuilder::default()
            .sandbox(false)
            .build()
            .map_err(|err| AppError::Processing(format!("Failed to launch Chrome: {err}")))?;
        Browser::new(options)
            .map_err(|err| AppError::Processing(format!("Failed to start Chrome: {err}")))
    }
    #[cfg(not(feature = "docker"))]
    {
        Browser::default()
            .map_err(|err| AppError::Processing(format!("Failed to start Chrome: {err}")))
    }
}

/// Transcribes every rendered page concurrently and joins the results with
/// page markers.
async fn vision_markdown(
    rendered_pages: Vec<Vec<u8>>,
    llm: &Arc<LlmClient>,
) -> Result<String, AppError> {
    let page_results: Vec<Result<String, AppError>> = stream::iter(
        rendered_pages
            .into_iter()
            .map(|png| transcribe_with_retry(llm, vec![STANDARD.encode(png)])),
    )
    .buffered(VISION_CONCURRENCY)
    .collect()
    .await;

    let mut sections = Vec::with_capacity(page_results.len());
    for (index, result) in page_results.into_iter().enumerate() {
        let markdown = result?;
        if index == 0 {
            sections.push(markdown);
        } else {
            sections.push(format!("--- Página {} ---\n\n{markdown}", index + 1));
        }
    }

    Ok(sections.join("\n\n"))
}

async fn transcribe_with_retry(
    llm: &Arc<LlmClient>,
    encoded_images: Vec<String>,
) -> Result<String, AppError> {
    for attempt in 0..MAX_VISION_ATTEMPTS {
        let prompt = if attempt == 0 {
            PAGE_MARKDOWN_PROMPT
        } else {
            PAGE_MARKDOWN_PROMPT_RETRY
        };

        let content = llm.chat_vision(prompt, &encoded_images).await?;
        if is_low_quality_response(&content) {
            warn!(attempt, "Vision model returned a low quality transcription");
            continue;
        }
        return Ok(content.trim().to_owned());
    }

    Err(AppError::Processing(
        "Vision model failed to transcribe page contents".into(),
    ))
}

fn is_low_quality_response(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_ascii_lowercase();
    lowered.contains("no puedo") || lowered.contains("unable to") || lowered.contains("cannot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_fails_quality_heuristic() {
        assert!(!looks_good_enough("demasiado corto"));
    }

    #[test]
    fn prose_passes_quality_heuristic() {
        let text = "Este es un texto razonablemente largo en su mayoria ASCII que deberia \
        pasar la heuristica. Contiene varias oraciones con una proporcion alta de letras.";
        assert!(looks_good_enough(text));
    }

    #[test]
    fn binary_noise_fails_quality_heuristic() {
        let noise: String = std::iter::repeat("\u{fffd}\u{fffd}0101")
            .take(100)
            .collect();
        assert!(!looks_good_enough(&noise));
    }

    #[test]
    fn low_quality_vision_responses_are_detected() {
        assert!(is_low_quality_response(""));
        assert!(is_low_quality_response("No puedo ver la imagen."));
        assert!(is_low_quality_response("I am unable to read this."));
        assert!(!is_low_quality_response("# Artículo 1\nContenido válido"));
    }
}
