use crate::types::ToolDescriptor;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate tool id '{id}' in catalog")]
    DuplicateTool { id: String },
    #[error("tool '{id}' has an empty id")]
    EmptyId { id: String },
}

/// Immutable per-session registry of tool descriptors. Shared read-only
/// across conversations; built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<Arc<ToolDescriptor>>,
    by_id: HashMap<String, usize>,
}

impl ToolCatalog {
    pub fn new(descriptors: Vec<ToolDescriptor>) -> Result<Self, CatalogError> {
        let mut tools = Vec::with_capacity(descriptors.len());
        let mut by_id = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.id.trim().is_empty() {
                return Err(CatalogError::EmptyId {
                    id: descriptor.id.clone(),
                });
            }
            if by_id.contains_key(&descriptor.id) {
                return Err(CatalogError::DuplicateTool {
                    id: descriptor.id.clone(),
                });
            }
            by_id.insert(descriptor.id.clone(), tools.len());
            tools.push(Arc::new(descriptor));
        }
        debug!(tools = tools.len(), "Tool catalog assembled");
        Ok(Self { tools, by_id })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ToolDescriptor>> {
        self.by_id.get(id).map(|index| &self.tools[*index])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ToolDescriptor>> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn eager_ids(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|tool| tool.eager)
            .map(|tool| tool.id.clone())
            .collect()
    }
}

/// Namespace a provider-supplied tool name so tools from different providers
/// never collide inside one catalog.
pub fn qualified_id(provider: &str, tool: &str) -> String {
    format!("{provider}.{tool}")
}

/// Split a provider-qualified id back into provider name and bare tool name.
pub fn split_qualified(id: &str) -> Option<(&str, &str)> {
    id.split_once('.')
}

/// Flatten a descriptor into the text searched and embedded by the indices:
/// id, description, example invocations, then parameter names and their
/// schema descriptions.
pub fn index_text(descriptor: &ToolDescriptor) -> String {
    let mut parts = vec![
        format!("Tool: {}", descriptor.id),
        format!("Description: {}", descriptor.description),
    ];

    for example in &descriptor.examples {
        match example {
            Value::String(text) => parts.push(format!("Example: {text}")),
            other => parts.push(format!("Example: {other}")),
        }
    }

    if let Some(properties) = descriptor
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
    {
        let mut rendered = Vec::with_capacity(properties.len());
        for (name, schema) in properties {
            let kind = schema.get("type").and_then(Value::as_str).unwrap_or("");
            let description = schema
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            rendered.push(format!("{name} ({kind}): {description}"));
        }
        if !rendered.is_empty() {
            parts.push(format!("Parameters: {}", rendered.join(", ")));
        }
    }

    parts.join("\n")
}

#[cfg(test)]
pub(crate) fn descriptor(id: &str, description: &str, eager: bool) -> ToolDescriptor {
    ToolDescriptor {
        id: id.to_string(),
        description: description.to_string(),
        input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        examples: Vec::new(),
        eager,
        provider: crate::types::ProviderRef::Local,
    }
}
