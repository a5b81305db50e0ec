use std::sync::Arc;

use common::utils::llm::LlmClient;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which path handles the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryAgent {
    Compliance,
    Report,
    QueryUnderstanding,
}

/// Routing decision for one user query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorPlan {
    pub primary_agent: PrimaryAgent,
    pub requires_query_understanding: bool,
    pub requires_complex_handling: bool,
    #[serde(default)]
    pub additional_info: serde_json::Value,
}

impl Default for OrchestratorPlan {
    fn default() -> Self {
        Self {
            primary_agent: PrimaryAgent::Compliance,
            requires_query_understanding: true,
            requires_complex_handling: false,
            additional_info: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawPlan {
    #[serde(default)]
    primary_agent: String,
    #[serde(default)]
    requires_query_understanding: Option<bool>,
    #[serde(default)]
    requires_complex_handling: Option<bool>,
    #[serde(default)]
    additional_info: serde_json::Value,
}

const PLANNER_SYSTEM: &str = "Eres el orquestador de un sistema de consultas normativas. \
Tu única función es decidir la ruta de ejecución; nunca respondas la consulta directamente. \
Rutas disponibles: 'compliance' (consultas normativas, de cumplimiento y análisis GAP), \
'report' (peticiones explícitas de generar un reporte o informe documental) y \
'query_understanding' (consultas ambiguas que solo requieren clarificación). \
Responde únicamente un objeto JSON: {\"primary_agent\": \"compliance|report|query_understanding\", \
\"requires_query_understanding\": bool, \"requires_complex_handling\": bool, \
\"additional_info\": objeto}.";

fn parse_agent(value: &str) -> PrimaryAgent {
    match value.to_ascii_lowercase().as_str() {
        "report" => PrimaryAgent::Report,
        "query_understanding" => PrimaryAgent::QueryUnderstanding,
        _ => PrimaryAgent::Compliance,
    }
}

fn map_raw(raw: RawPlan) -> OrchestratorPlan {
    OrchestratorPlan {
        primary_agent: parse_agent(&raw.primary_agent),
        requires_query_understanding: raw.requires_query_understanding.unwrap_or(true),
        requires_complex_handling: raw.requires_complex_handling.unwrap_or(false),
        additional_info: raw.additional_info,
    }
}

/// One planning LLM call per request; every failure mode falls back to the
/// default compliance route.
pub struct Planner {
    llm: Arc<LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn plan(&self, query: &str) -> OrchestratorPlan {
        match self
            .llm
            .chat_json::<RawPlan>(&self.llm.llm_model, PLANNER_SYSTEM, query)
            .await
        {
            Ok(raw) => map_raw(raw),
            Err(err) => {
                warn!(error = %err, "Planning call failed; defaulting to compliance route");
                OrchestratorPlan::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_plan_maps_report_route() {
        let raw: RawPlan = serde_json::from_str(
            r#"{
                "primary_agent": "report",
                "requires_query_understanding": true,
                "requires_complex_handling": false,
                "additional_info": {"formato": "normativo"}
            }"#,
        )
        .expect("parse");

        let plan = map_raw(raw);
        assert_eq!(plan.primary_agent, PrimaryAgent::Report);
        assert!(plan.requires_query_understanding);
        assert_eq!(plan.additional_info["formato"], "normativo");
    }

    #[test]
    fn unknown_agent_defaults_to_compliance() {
        let raw = RawPlan {
            primary_agent: "algo_raro".into(),
            ..RawPlan::default()
        };
        assert_eq!(map_raw(raw).primary_agent, PrimaryAgent::Compliance);
    }

    #[test]
    fn missing_flags_use_safe_defaults() {
        let raw: RawPlan = serde_json::from_str(r#"{"primary_agent": "compliance"}"#)
            .expect("parse");
        let plan = map_raw(raw);
        assert!(plan.requires_query_understanding);
        assert!(!plan.requires_complex_handling);
    }
}
