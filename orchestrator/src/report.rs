use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::Utc;
use common::{error::AppError, utils::llm::LlmClient};
use minijinja::Environment;
use tracing::{info, instrument};

/// Template used when no custom report template is configured.
const DEFAULT_TEMPLATE: &str = "\
# Informe normativo

Fecha de elaboración: {{ fecha }}

## Resumen ejecutivo

{{ resumen_ejecutivo }}

## Análisis normativo

{{ analisis_normativo }}

## Obligaciones principales

{{ obligaciones }}

## Conclusiones y recomendaciones

{{ conclusiones }}
";

const SECTION_SYSTEM: &str = "Eres un redactor de informes normativos. A partir del análisis \
proporcionado, redacta la sección solicitada en tono formal y en español. Responde solo con \
el contenido de la sección, sin títulos.";

/// Named placeholders in a template source.
pub fn template_placeholders(template_source: &str) -> Result<Vec<String>, AppError> {
    let mut env = Environment::new();
    env.add_template("report", template_source)
        .map_err(|err| AppError::Validation(format!("invalid report template: {err}")))?;
    let template = env
        .get_template("report")
        .map_err(|err| AppError::InternalError(err.to_string()))?;

    let mut placeholders: Vec<String> = template
        .undeclared_variables(true)
        .into_iter()
        .collect();
    placeholders.sort();
    Ok(placeholders)
}

/// Renders the template with every placeholder substituted.
pub fn render_report(
    template_source: &str,
    sections: &HashMap<String, String>,
) -> Result<String, AppError> {
    let mut env = Environment::new();
    env.add_template("report", template_source)
        .map_err(|err| AppError::Validation(format!("invalid report template: {err}")))?;
    let template = env
        .get_template("report")
        .map_err(|err| AppError::InternalError(err.to_string()))?;

    template
        .render(sections)
        .map_err(|err| AppError::InternalError(format!("report render failed: {err}")))
}

/// Fills the report template with per-section LLM-generated content and
/// writes the rendered report to disk.
pub struct ReportFormatter {
    llm: Arc<LlmClient>,
    template_path: Option<PathBuf>,
    output_dir: PathBuf,
}

impl ReportFormatter {
    pub fn new(llm: Arc<LlmClient>, template_path: Option<PathBuf>, output_dir: PathBuf) -> Self {
        Self {
            llm,
            template_path,
            output_dir,
        }
    }

    async fn template_source(&self) -> Result<String, AppError> {
        match &self.template_path {
            Some(path) => Ok(tokio::fs::read_to_string(path).await?),
            None => Ok(DEFAULT_TEMPLATE.to_owned()),
        }
    }

    /// Generates one report from the analysis text the compliance path
    /// produced; returns the written file's path.
    #[instrument(skip_all, fields(query_chars = query.chars().count()))]
    pub async fn generate(&self, query: &str, analysis: &str) -> Result<PathBuf, AppError> {
        let template_source = self.template_source().await?;
        let placeholders = template_placeholders(&template_source)?;

        let mut sections: HashMap<String, String> = HashMap::new();
        for placeholder in &placeholders {
            let content = if placeholder == "fecha" {
                Utc::now().format("%Y-%m-%d").to_string()
            } else {
                let prompt = format!(
                    "Consulta original: {query}\n\nAnálisis disponible:\n{analysis}\n\n\
                     Sección a redactar: {placeholder}"
                );
                self.llm
                    .chat_text(&self.llm.llm_model_advanced, SECTION_SYSTEM, &prompt)
                    .await?
            };
            sections.insert(placeholder.clone(), content);
        }

        let rendered = render_report(&template_source, &sections)?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let file_name = format!("reporte_{}.md", Utc::now().format("%Y%m%d%H%M%S"));
        let path = self.output_dir.join(file_name);
        tokio::fs::write(&path, rendered).await?;

        info!(path = %path.display(), sections = placeholders.len(), "Report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_discovered_from_template() {
        let placeholders = template_placeholders(DEFAULT_TEMPLATE).expect("placeholders");
        assert_eq!(
            placeholders,
            vec![
                "analisis_normativo",
                "conclusiones",
                "fecha",
                "obligaciones",
                "resumen_ejecutivo"
            ]
        );
    }

    #[test]
    fn render_substitutes_every_placeholder() {
        let mut sections = HashMap::new();
        for key in template_placeholders(DEFAULT_TEMPLATE).expect("placeholders") {
            sections.insert(key.clone(), format!("contenido de {key}"));
        }

        let rendered = render_report(DEFAULT_TEMPLATE, &sections).expect("render");
        assert!(rendered.contains("contenido de resumen_ejecutivo"));
        assert!(rendered.contains("contenido de conclusiones"));
        assert!(!rendered.contains("{{"));
    }

    #[test]
    fn invalid_template_is_rejected() {
        let result = template_placeholders("{{ sin_cerrar");
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn custom_templates_render_their_own_placeholders() {
        let template = "Informe sobre {{ tema }} — {{ alcance }}";
        let mut sections = HashMap::new();
        sections.insert("tema".to_string(), "LFPDPPP".to_string());
        sections.insert("alcance".to_string(), "nacional".to_string());

        let rendered = render_report(template, &sections).expect("render");
        assert_eq!(rendered, "Informe sobre LFPDPPP — nacional");
    }
}
