use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::dispatch::TokenUsage;

pub const DEFAULT_AGENT_ID: &str = "general";

/// Invocation contract every agent backend fulfills. Handlers may call
/// external services but never touch the session store.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn invoke(&self, invocation: &AgentInvocation) -> Result<AgentReply>;
}

#[derive(Debug, Clone, Default)]
pub struct AgentInvocation {
    pub query: String,
    pub file_path: Option<String>,
    pub history: String,
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub tool_name: String,
    pub description: String,
    #[serde(default)]
    pub trigger_terms: Vec<String>,
}

/// Arguments accepted by every tool exposed on the registry's
/// introspection surface.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ToolArguments {
    /// The user's question or instruction.
    pub query: String,
    /// Optional path to an uploaded file for context.
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

struct RegistryEntry {
    descriptor: AgentDescriptor,
    handler: Arc<dyn AgentHandler>,
}

/// Static lookup table from agent identifier to invocation contract.
/// Built and validated once at startup; adding an agent is a data edit
/// in the catalog, not a control-flow change.
pub struct AgentRegistry {
    entries: Vec<RegistryEntry>,
    default_id: String,
}

impl AgentRegistry {
    pub fn new(
        catalog: Vec<(AgentDescriptor, Arc<dyn AgentHandler>)>,
        default_id: &str,
    ) -> Result<Self> {
        if catalog.is_empty() {
            return Err(anyhow::anyhow!("agent registry cannot be empty"));
        }

        let mut seen_ids = BTreeSet::new();
        let mut seen_tools = BTreeSet::new();
        for (descriptor, _) in &catalog {
            if !seen_ids.insert(descriptor.id.clone()) {
                return Err(anyhow::anyhow!(
                    "duplicate agent id '{}' in registry catalog",
                    descriptor.id
                ));
            }
            if !seen_tools.insert(descriptor.tool_name.clone()) {
                return Err(anyhow::anyhow!(
                    "duplicate tool name '{}' in registry catalog",
                    descriptor.tool_name
                ));
            }
        }

        if !seen_ids.contains(default_id) {
            return Err(anyhow::anyhow!(
                "default agent '{}' is not in the registry catalog",
                default_id
            ));
        }

        Ok(Self {
            entries: catalog
                .into_iter()
                .map(|(descriptor, handler)| RegistryEntry {
                    descriptor,
                    handler,
                })
                .collect(),
            default_id: default_id.to_string(),
        })
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.entries.iter().map(|entry| &entry.descriptor)
    }

    pub fn known_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.descriptor.id.clone())
            .collect()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.descriptor.id == agent_id)
    }

    pub fn handler(&self, agent_id: &str) -> Option<Arc<dyn AgentHandler>> {
        self.entries
            .iter()
            .find(|entry| entry.descriptor.id == agent_id)
            .map(|entry| entry.handler.clone())
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let parameters = tool_parameters_schema();
        self.entries
            .iter()
            .map(|entry| ToolDefinition {
                name: entry.descriptor.tool_name.clone(),
                description: entry.descriptor.description.clone(),
                parameters: parameters.clone(),
            })
            .collect()
    }

    pub fn resolve_tool(
        &self,
        tool_name: &str,
    ) -> Option<(&AgentDescriptor, Arc<dyn AgentHandler>)> {
        self.entries
            .iter()
            .find(|entry| entry.descriptor.tool_name == tool_name)
            .map(|entry| (&entry.descriptor, entry.handler.clone()))
    }
}

pub fn tool_parameters_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(ToolArguments))
        .unwrap_or_else(|_| json!({ "type": "object" }))
}

pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(1)
}

/// Fallback assistant used when no model-backed handler is wired in.
/// Restates the request so the full pipeline stays exercisable without
/// external credentials.
pub struct OfflineGeneralHandler;

#[async_trait]
impl AgentHandler for OfflineGeneralHandler {
    async fn invoke(&self, invocation: &AgentInvocation) -> Result<AgentReply> {
        let mut text = String::from("## General Assistant\n\n");
        text.push_str(&format!("**Your question:** {}\n\n", invocation.query.trim()));
        if invocation.history.is_empty() {
            text.push_str("This is the first message in the session.\n\n");
        } else {
            text.push_str("Earlier turns from this session were taken into account.\n\n");
        }
        text.push_str(
            "No model backend is configured, so this is a canned reply. \
             Wire an `AgentHandler` for `general` to get live answers.",
        );

        let usage = TokenUsage {
            input_tokens: estimate_tokens(&invocation.query) + estimate_tokens(&invocation.history),
            output_tokens: estimate_tokens(&text),
        };
        Ok(AgentReply { text, usage })
    }
}

/// Placeholder for capability backends that need external credentials.
/// Always errors, which the dispatcher turns into an inline notice.
pub struct UnconfiguredHandler {
    agent_id: String,
    hint: String,
}

impl UnconfiguredHandler {
    pub fn new(agent_id: &str, hint: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            hint: hint.to_string(),
        }
    }
}

#[async_trait]
impl AgentHandler for UnconfiguredHandler {
    async fn invoke(&self, _invocation: &AgentInvocation) -> Result<AgentReply> {
        Err(anyhow::anyhow!(
            "the '{}' backend is not configured ({})",
            self.agent_id,
            self.hint
        ))
    }
}

pub fn builtin_descriptors() -> Vec<AgentDescriptor> {
    let terms = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<String>>();
    vec![
        AgentDescriptor {
            id: "rag".to_string(),
            tool_name: "rag_search".to_string(),
            description: "Search through locally uploaded documents using retrieval-augmented \
                          generation. Best for questions about uploaded files such as PDFs, \
                          CSVs, or text."
                .to_string(),
            trigger_terms: Vec::new(),
        },
        AgentDescriptor {
            id: "multimodal".to_string(),
            tool_name: "multimodal_analysis".to_string(),
            description: "Analyse images together with text using a vision-capable model. \
                          Supports PNG, JPG, GIF, and WebP."
                .to_string(),
            trigger_terms: Vec::new(),
        },
        AgentDescriptor {
            id: "nasa".to_string(),
            tool_name: "nasa_query".to_string(),
            description: "Query NASA public APIs for space-related data including APOD, Mars \
                          rover photos, Near-Earth Objects, and image search."
                .to_string(),
            trigger_terms: terms(&[
                "nasa",
                "space",
                "apod",
                "mars",
                "rover",
                "asteroid",
                "nebula",
                "galaxy",
                "planet",
                "satellite",
                "spacecraft",
                "rocket",
                "astronomy",
                "cosmos",
                "near earth",
                "neo",
                "picture of the day",
                "hubble",
                "james webb",
                "jwst",
                "orbit",
                "comet",
                "meteor",
                "solar system",
                "moon landing",
                "iss",
                "international space station",
            ]),
        },
        AgentDescriptor {
            id: "weather".to_string(),
            tool_name: "weather_lookup".to_string(),
            description: "Get current weather conditions for a location. Provides temperature, \
                          humidity, wind, UV index, and more."
                .to_string(),
            trigger_terms: terms(&[
                "weather",
                "temperature",
                "forecast",
                "rain",
                "snow",
                "sunny",
                "cloudy",
                "humidity",
                "wind speed",
                "uv index",
                "heat",
                "cold",
                "storm",
                "thunder",
                "hail",
                "fog",
                "climate",
                "feels like",
                "dew point",
                "barometer",
                "precipitation",
            ]),
        },
        AgentDescriptor {
            id: "traffic".to_string(),
            tool_name: "traffic_route".to_string(),
            description: "Get traffic and route information between two locations. Provides \
                          travel time, distance, delays, and ETA."
                .to_string(),
            trigger_terms: terms(&[
                "traffic",
                "route",
                "directions",
                "driving",
                "commute",
                "drive from",
                "how long to drive",
                "road",
                "highway",
                "travel time",
                "distance from",
                "eta",
                "navigation",
                "traffic from",
                "route from",
                "directions from",
            ]),
        },
        AgentDescriptor {
            id: "sql".to_string(),
            tool_name: "sql_query".to_string(),
            description: "Query the Northwind database using natural language. Generates SQL, \
                          executes it, and returns a natural-language answer with data tables."
                .to_string(),
            trigger_terms: terms(&[
                "sql",
                "database",
                "northwind",
                "query",
                "table",
                "customers",
                "orders",
                "products",
                "employees",
                "suppliers",
                "categories",
                "shippers",
                "territories",
                "regions",
                "order details",
                "how many orders",
                "top selling",
                "total sales",
                "revenue",
                "most ordered",
                "least ordered",
                "employee list",
                "customer list",
                "product list",
                "average price",
                "total quantity",
                "inventory",
            ]),
        },
        AgentDescriptor {
            id: "viz".to_string(),
            tool_name: "visualize_data".to_string(),
            description: "Create data visualizations (bar chart, pie chart, line chart, \
                          histogram, and more) from the Northwind database."
                .to_string(),
            trigger_terms: terms(&[
                "chart",
                "graph",
                "plot",
                "visualize",
                "visualise",
                "visualization",
                "bar chart",
                "pie chart",
                "bubble chart",
                "line chart",
                "histogram",
                "donut",
                "area chart",
                "scatter",
                "show me a chart",
                "draw a chart",
                "create a chart",
                "stacked bar",
                "grouped bar",
                "horizontal bar",
                "diagram",
                "infographic",
            ]),
        },
        AgentDescriptor {
            id: "cicp".to_string(),
            tool_name: "cicp_process".to_string(),
            description: "Car Insurance Claim Processing (CICP) agent. Analyses an uploaded \
                          claim form and damaged car photo, retrieves applicable insurance \
                          rules, and renders an APPROVE / REJECT decision. Requires both a \
                          claim form (document) and damage photo (image) to be uploaded."
                .to_string(),
            trigger_terms: Vec::new(),
        },
        AgentDescriptor {
            id: "ida".to_string(),
            tool_name: "ida_design".to_string(),
            description: "Interior Design Agent (IDA). Analyses a room image, suggests \
                          complementary furniture, and searches the product catalogue for \
                          matching items with product IDs."
                .to_string(),
            trigger_terms: Vec::new(),
        },
        AgentDescriptor {
            id: "fhir".to_string(),
            tool_name: "fhir_convert".to_string(),
            description: "FHIR Data Conversion Agent. Converts healthcare data (CSV, HL7v2, \
                          CDA, free-text clinical notes) into valid FHIR R4 JSON resources. \
                          Generates Patient, Observation, Condition, MedicationRequest, and \
                          other FHIR resources with proper coding (SNOMED CT, LOINC, ICD-10)."
                .to_string(),
            trigger_terms: Vec::new(),
        },
        AgentDescriptor {
            id: "banking".to_string(),
            tool_name: "banking_assist".to_string(),
            description: "Banking Customer Service Agent. Answers questions about customer \
                          accounts, transactions, loans, cards, fraud alerts, support \
                          tickets, and branch information, plus bank policies, fee \
                          schedules, interest rates, and overdraft rules."
                .to_string(),
            trigger_terms: Vec::new(),
        },
        AgentDescriptor {
            id: "general".to_string(),
            tool_name: "general_assistant".to_string(),
            description: "A general-purpose assistant for any question that does not involve \
                          uploaded documents, images, or specialised data sources."
                .to_string(),
            trigger_terms: Vec::new(),
        },
    ]
}

/// Registry wired with placeholder backends. Real deployments swap in
/// handlers that call their services; tests swap in scripted handlers.
pub fn builtin_registry(default_id: &str) -> Result<AgentRegistry> {
    let catalog = builtin_descriptors()
        .into_iter()
        .map(|descriptor| {
            let handler: Arc<dyn AgentHandler> = match descriptor.id.as_str() {
                "general" => Arc::new(OfflineGeneralHandler),
                id => Arc::new(UnconfiguredHandler::new(
                    id,
                    "wire a handler for this agent id when building the registry",
                )),
            };
            (descriptor, handler)
        })
        .collect();
    AgentRegistry::new(catalog, default_id)
}
