//! Gated Tool Registry and Wire Shapes
//!
//! Each registered tool declares the permission it needs, its risk level,
//! and how constraint values are extracted from request inputs. The handler
//! is an opaque async callback; the gate decides, the handler executes.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditRecord;
use crate::catalog::RiskLevel;
use crate::normalize::{normalize, NormalizeMode};
use crate::receipt::Receipt;
use crate::{GateError, Result};

/// A tool invocation as routed in by the host transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub meta: CallMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_id: Option<String>,
}

/// One content block in a tool response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Denial details surfaced in response metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenialMeta {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reason_codes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub obligations: Vec<String>,
    pub confident: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<DenialMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AuditRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumption: Option<Receipt>,
}

/// A tool response in the host wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    #[serde(rename = "isError")]
    pub is_error: bool,
    pub content: Vec<ContentBlock>,
    #[serde(rename = "_meta", default)]
    pub meta: ResponseMeta,
}

impl ToolCallResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            is_error: false,
            content: vec![ContentBlock::text(text)],
            meta: ResponseMeta::default(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: vec![ContentBlock::text(text)],
            meta: ResponseMeta::default(),
        }
    }
}

/// Value transformation applied to an extracted input.
#[derive(Clone)]
pub enum Transform {
    None,
    /// Normalize a dollar string into integer cents (precision 2, strict,
    /// unless the mapping overrides).
    DollarsToCents,
    Custom(Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>),
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transform::None => write!(f, "None"),
            Transform::DollarsToCents => write!(f, "DollarsToCents"),
            Transform::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Where a constraint value comes from.
#[derive(Debug, Clone)]
pub enum MappingSource {
    Fixed {
        value: Value,
    },
    Input {
        /// Dot path into the arguments, e.g. `$.price` or `$.booking.total`.
        path: String,
        transform: Transform,
        precision: Option<u32>,
        mode: Option<NormalizeMode>,
    },
}

/// Binds one context key to a value extracted per call.
#[derive(Debug, Clone)]
pub struct ConstraintMapping {
    pub key: String,
    pub source: MappingSource,
}

impl ConstraintMapping {
    pub fn fixed(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            source: MappingSource::Fixed { value },
        }
    }

    pub fn input(key: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            source: MappingSource::Input {
                path: path.into(),
                transform: Transform::None,
                precision: None,
                mode: None,
            },
        }
    }

    pub fn dollars(key: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            source: MappingSource::Input {
                path: path.into(),
                transform: Transform::DollarsToCents,
                precision: None,
                mode: None,
            },
        }
    }
}

/// Async handler invoked on permit.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A registered tool.
#[derive(Clone)]
pub struct GatedTool {
    pub name: String,
    pub permission: String,
    pub risk: RiskLevel,
    pub input_schema: Value,
    pub mappings: Vec<ConstraintMapping>,
    pub handler: Handler,
}

impl GatedTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        permission: impl Into<String>,
        risk: RiskLevel,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            permission: permission.into(),
            risk,
            input_schema,
            mappings: vec![],
            handler: Arc::new(move |args| -> BoxFuture<'static, Result<Value>> {
                Box::pin(handler(args))
            }),
        }
    }

    pub fn with_mapping(mut self, mapping: ConstraintMapping) -> Self {
        self.mappings.push(mapping);
        self
    }
}

/// The set of tools behind this gate.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<GatedTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: GatedTool) {
        if self.tools.contains_key(&tool.name) {
            tracing::warn!(tool = %tool.name, "replacing previously registered tool");
        }
        self.tools.insert(tool.name.clone(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<GatedTool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Alternative tools to suggest on denial: everything registered except
    /// the failing tool and anything critical-risk.
    pub fn suggestions(&self, except: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|t| t.name != except && t.risk < RiskLevel::Critical)
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Walk a `$.a.b.0.c` style path into the arguments.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let stripped = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
    if stripped.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in stripped.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn decimal_text(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(GateError::InvalidNumeric(other.to_string())),
    }
}

/// Build the per-request context from a tool's constraint mappings.
///
/// A mapping that fails to resolve or transform is logged and skipped; it
/// never fails the call. Keys containing `cost` or `price` also bind the
/// canonical integer under `amount_canonical` for the cost evaluator.
pub fn extract_context(tool: &GatedTool, arguments: &Value) -> HashMap<String, Value> {
    let mut context = HashMap::new();

    for mapping in &tool.mappings {
        let raw = match &mapping.source {
            MappingSource::Fixed { value } => Some(value.clone()),
            MappingSource::Input { path, .. } => resolve_path(arguments, path).cloned(),
        };
        let raw = match raw {
            Some(v) => v,
            None => {
                tracing::warn!(tool = %tool.name, key = %mapping.key, "mapping input missing, skipping");
                continue;
            }
        };

        let value = match &mapping.source {
            MappingSource::Fixed { .. } => Ok(raw),
            MappingSource::Input {
                transform,
                precision,
                mode,
                ..
            } => match transform {
                Transform::None => Ok(raw),
                Transform::DollarsToCents => decimal_text(&raw).and_then(|text| {
                    normalize(
                        &text,
                        precision.unwrap_or(2),
                        mode.unwrap_or(NormalizeMode::Strict),
                    )
                    .map(Value::from)
                }),
                Transform::Custom(f) => f(&raw),
            },
        };

        match value {
            Ok(v) => {
                if mapping.key.contains("cost") || mapping.key.contains("price") {
                    context.insert(crate::constraints::AMOUNT_CANONICAL.to_string(), v.clone());
                }
                context.insert(mapping.key.clone(), v);
            }
            Err(e) => {
                tracing::warn!(tool = %tool.name, key = %mapping.key, error = %e, "mapping failed, skipping");
            }
        }
    }

    context
}
