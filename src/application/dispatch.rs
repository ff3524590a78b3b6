use crate::application::catalog::{ToolCatalog, split_qualified};
use crate::types::{ProviderRef, ToolFault, ToolOutcome};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Leaf executor for a locally-registered tool. The business logic behind a
/// tool is interchangeable; the engine only sees this seam.
pub trait ToolExecutor: Send + Sync {
    fn execute(&self, arguments: &Value) -> Result<Value, ExecutorError>;
}

impl<F> ToolExecutor for F
where
    F: Fn(&Value) -> Result<Value, ExecutorError> + Send + Sync,
{
    fn execute(&self, arguments: &Value) -> Result<Value, ExecutorError> {
        self(arguments)
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("provider '{provider}' unavailable: {message}")]
    Unavailable { provider: String, message: String },
    #[error("provider '{provider}' rejected the call: {message}")]
    Rejected { provider: String, message: String },
}

/// Boundary to remote capability providers. Implemented by the provider
/// pool in the infrastructure layer.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke_tool(
        &self,
        provider: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, RemoteError>;
}

/// Routes an invocation to its executor and wraps every result or fault
/// into the normalized `ToolOutcome` envelope. Per-tool failures never
/// escape as errors; the envelope is what flows back to the model.
pub struct CapabilityDispatcher {
    catalog: Arc<ToolCatalog>,
    local: HashMap<String, Arc<dyn ToolExecutor>>,
    remote: Option<Arc<dyn RemoteInvoker>>,
    timeout: Duration,
}

impl CapabilityDispatcher {
    pub fn new(catalog: Arc<ToolCatalog>, timeout: Duration) -> Self {
        Self {
            catalog,
            local: HashMap::new(),
            remote: None,
            timeout,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteInvoker>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn register_local(&mut self, tool_id: impl Into<String>, executor: Arc<dyn ToolExecutor>) {
        self.local.insert(tool_id.into(), executor);
    }

    pub async fn invoke(&self, tool_id: &str, arguments: Value) -> ToolOutcome {
        let Some(descriptor) = self.catalog.get(tool_id) else {
            warn!(tool = %tool_id, "Invocation references a tool absent from the catalog");
            return ToolOutcome::Error {
                kind: ToolFault::UnknownTool,
                message: format!("tool '{tool_id}' is not in the catalog"),
            };
        };

        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        let outcome = match &descriptor.provider {
            ProviderRef::Local => self.invoke_local(tool_id, &arguments),
            ProviderRef::Remote(provider) => {
                self.invoke_remote(provider, tool_id, arguments).await
            }
        };
        info!(tool = %tool_id, success = outcome.is_ok(), "Tool dispatched");
        outcome
    }

    fn invoke_local(&self, tool_id: &str, arguments: &Value) -> ToolOutcome {
        let Some(executor) = self.local.get(tool_id) else {
            warn!(tool = %tool_id, "No local executor registered for catalog tool");
            return ToolOutcome::Error {
                kind: ToolFault::ExecutionFailed,
                message: format!("no executor registered for tool '{tool_id}'"),
            };
        };
        debug!(tool = %tool_id, "Dispatching to local executor");
        match executor.execute(arguments) {
            Ok(value) => ToolOutcome::Ok { value },
            Err(err) => ToolOutcome::Error {
                kind: ToolFault::ExecutionFailed,
                message: err.message,
            },
        }
    }

    async fn invoke_remote(&self, provider: &str, tool_id: &str, arguments: Value) -> ToolOutcome {
        let Some(remote) = &self.remote else {
            return ToolOutcome::Error {
                kind: ToolFault::ProviderUnavailable,
                message: format!("no remote invoker configured for provider '{provider}'"),
            };
        };

        // Catalog ids for remote tools are provider-qualified.
        let bare_name = match split_qualified(tool_id) {
            Some((prefix, name)) if prefix == provider => name,
            _ => tool_id,
        };

        debug!(tool = %tool_id, provider = %provider, "Dispatching to remote provider");
        let call = remote.invoke_tool(provider, bare_name, arguments);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => ToolOutcome::Ok { value },
            Ok(Err(RemoteError::Rejected { message, .. })) => ToolOutcome::Error {
                kind: ToolFault::ExecutionFailed,
                message,
            },
            Ok(Err(RemoteError::Unavailable { message, .. })) => ToolOutcome::Error {
                kind: ToolFault::ProviderUnavailable,
                message,
            },
            Err(_) => {
                warn!(tool = %tool_id, provider = %provider, "Remote dispatch timed out");
                ToolOutcome::Error {
                    kind: ToolFault::ProviderUnavailable,
                    message: format!(
                        "provider '{provider}' did not answer within {:?}",
                        self.timeout
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::catalog::descriptor;
    use crate::types::ToolDescriptor;
    use serde_json::json;

    fn remote_descriptor(id: &str, provider: &str) -> ToolDescriptor {
        let mut tool = descriptor(id, "remote tool", false);
        tool.provider = ProviderRef::Remote(provider.to_string());
        tool
    }

    struct SlowInvoker;

    #[async_trait]
    impl RemoteInvoker for SlowInvoker {
        async fn invoke_tool(
            &self,
            _provider: &str,
            _tool: &str,
            _arguments: Value,
        ) -> Result<Value, RemoteError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct EchoInvoker;

    #[async_trait]
    impl RemoteInvoker for EchoInvoker {
        async fn invoke_tool(
            &self,
            provider: &str,
            tool: &str,
            arguments: Value,
        ) -> Result<Value, RemoteError> {
            Ok(json!({ "provider": provider, "tool": tool, "arguments": arguments }))
        }
    }

    #[tokio::test]
    async fn unknown_tool_yields_unknown_tool_error() {
        let catalog = Arc::new(ToolCatalog::new(vec![]).expect("catalog builds"));
        let dispatcher = CapabilityDispatcher::new(catalog, Duration::from_secs(1));
        let outcome = dispatcher.invoke("ghost", Value::Null).await;
        assert!(matches!(
            outcome,
            ToolOutcome::Error {
                kind: ToolFault::UnknownTool,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn local_executor_success_is_wrapped() {
        let catalog = Arc::new(
            ToolCatalog::new(vec![descriptor("echo", "Echo arguments", false)])
                .expect("catalog builds"),
        );
        let mut dispatcher = CapabilityDispatcher::new(catalog, Duration::from_secs(1));
        dispatcher.register_local(
            "echo",
            Arc::new(|arguments: &Value| Ok(json!({ "echoed": arguments.clone() }))),
        );

        let outcome = dispatcher.invoke("echo", json!({ "x": 1 })).await;
        match outcome {
            ToolOutcome::Ok { value } => assert_eq!(value["echoed"]["x"], 1),
            other => panic!("expected success envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_executor_fault_becomes_execution_error() {
        let catalog = Arc::new(
            ToolCatalog::new(vec![descriptor("fails", "Always fails", false)])
                .expect("catalog builds"),
        );
        let mut dispatcher = CapabilityDispatcher::new(catalog, Duration::from_secs(1));
        dispatcher.register_local(
            "fails",
            Arc::new(|_: &Value| -> Result<Value, ExecutorError> {
                Err(ExecutorError::new("boom"))
            }),
        );

        let outcome = dispatcher.invoke("fails", Value::Null).await;
        assert!(matches!(
            outcome,
            ToolOutcome::Error {
                kind: ToolFault::ExecutionFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn remote_call_strips_provider_prefix() {
        let catalog = Arc::new(
            ToolCatalog::new(vec![remote_descriptor("github.create_issue", "github")])
                .expect("catalog builds"),
        );
        let dispatcher = CapabilityDispatcher::new(catalog, Duration::from_secs(1))
            .with_remote(Arc::new(EchoInvoker));

        let outcome = dispatcher
            .invoke("github.create_issue", json!({ "title": "bug" }))
            .await;
        match outcome {
            ToolOutcome::Ok { value } => {
                assert_eq!(value["provider"], "github");
                assert_eq!(value["tool"], "create_issue");
            }
            other => panic!("expected success envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_timeout_is_provider_unavailable() {
        let catalog = Arc::new(
            ToolCatalog::new(vec![remote_descriptor("slow.wait", "slow")])
                .expect("catalog builds"),
        );
        let dispatcher = CapabilityDispatcher::new(catalog, Duration::from_millis(20))
            .with_remote(Arc::new(SlowInvoker));

        let outcome = dispatcher.invoke("slow.wait", Value::Null).await;
        assert!(matches!(
            outcome,
            ToolOutcome::Error {
                kind: ToolFault::ProviderUnavailable,
                ..
            }
        ));
    }
}
