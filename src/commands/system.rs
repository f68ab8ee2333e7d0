use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::CommandHandler;
use crate::clock::Clock;
use crate::ingest::SystemControllerClient;
use crate::types::{new_command_id, CommandRequest, CommandResult};

pub const CONFIRM_REQUIRED: &str = "confirm required";
pub const UNSAFE_DISABLED: &str = "unsafe operations disabled";
pub const SERVICE_REQUIRED: &str = "service required";

/// Proxies power and service commands to the system controller.
///
/// Reboot and shutdown need both the request's confirm flag and the global
/// unsafe-operations gate; otherwise they are rejected without any HTTP call.
pub struct SystemCommandHandler {
    client: SystemControllerClient,
    allow_unsafe_operations: bool,
    clock: Arc<dyn Clock>,
}

impl SystemCommandHandler {
    pub fn new(client: SystemControllerClient, allow_unsafe_operations: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            allow_unsafe_operations,
            clock,
        }
    }

    fn reject(&self, command: String, detail: &str) -> CommandResult {
        warn!(command = %command, detail, "System command rejected");
        CommandResult::rejected(command, detail, self.clock.now_ms())
    }

    async fn power(&self, request: CommandRequest, action: &str) -> CommandResult {
        if !request.confirm {
            return self.reject(request.command, CONFIRM_REQUIRED);
        }
        if !self.allow_unsafe_operations {
            return self.reject(request.command, UNSAFE_DISABLED);
        }
        self.post(request.command, &format!("system/{action}"), json!({"confirm": true}))
            .await
    }

    async fn restart_service(&self, request: CommandRequest) -> CommandResult {
        let service = match request.payload.get("service") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => return self.reject(request.command, SERVICE_REQUIRED),
        };
        self.post(request.command, &format!("services/{service}/restart"), json!({}))
            .await
    }

    async fn post(&self, command: String, endpoint: &str, body: Value) -> CommandResult {
        let command_id = new_command_id();
        match self.client.post(endpoint, &body).await {
            Ok(()) => {
                info!(command = %command, endpoint, "System command accepted");
                CommandResult::new(command, command_id, true, None, self.clock.now_ms())
            }
            Err(e) => {
                warn!(command = %command, endpoint, error = %e, "System command failed");
                CommandResult::new(command, command_id, false, Some(e.to_string()), self.clock.now_ms())
            }
        }
    }
}

#[async_trait]
impl CommandHandler for SystemCommandHandler {
    fn can_handle(&self, command: &str) -> bool {
        matches!(command, "system/reboot" | "system/shutdown" | "services/restart")
    }

    async fn handle(&self, request: CommandRequest) -> CommandResult {
        match request.command.as_str() {
            "system/reboot" => self.power(request, "reboot").await,
            "system/shutdown" => self.power(request, "shutdown").await,
            "services/restart" => self.restart_service(request).await,
            _ => self.reject(request.command, "unsupported"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SystemControllerConfig;
    use crate::types::JsonMap;

    // Nothing listens on this port; gated requests must never reach it.
    fn handler(allow_unsafe: bool) -> SystemCommandHandler {
        let client = SystemControllerClient::new(&SystemControllerConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout_secs: 1,
            api_key: None,
        })
        .unwrap();
        SystemCommandHandler::new(client, allow_unsafe, Arc::new(ManualClock::new(77)))
    }

    #[tokio::test]
    async fn test_reboot_requires_confirm() {
        let result = handler(true).handle(CommandRequest::new("system/reboot")).await;
        assert!(!result.accepted);
        assert_eq!(result.detail.as_deref(), Some(CONFIRM_REQUIRED));
        assert_eq!(result.timestamp_ms, 77);
    }

    #[tokio::test]
    async fn test_shutdown_requires_unsafe_gate() {
        let request = CommandRequest::new("system/shutdown").with_confirm(true);
        let result = handler(false).handle(request).await;
        assert!(!result.accepted);
        assert_eq!(result.detail.as_deref(), Some(UNSAFE_DISABLED));
    }

    #[tokio::test]
    async fn test_restart_requires_service() {
        let h = handler(false);
        let result = h.handle(CommandRequest::new("services/restart")).await;
        assert_eq!(result.detail.as_deref(), Some(SERVICE_REQUIRED));

        let mut payload = JsonMap::new();
        payload.insert("service".into(), json!("  "));
        let result = h
            .handle(CommandRequest::new("services/restart").with_payload(payload))
            .await;
        assert_eq!(result.detail.as_deref(), Some(SERVICE_REQUIRED));
    }

    #[tokio::test]
    async fn test_http_failure_becomes_rejected_result() {
        let request = CommandRequest::new("system/reboot").with_confirm(true);
        let result = handler(true).handle(request).await;
        assert!(!result.accepted);
        assert!(result.detail.is_some_and(|d| d.contains("HTTP error")));
    }

    #[test]
    fn test_can_handle() {
        let h = handler(false);
        assert!(h.can_handle("system/reboot"));
        assert!(h.can_handle("services/restart"));
        assert!(!h.can_handle("scan/start"));
    }
}
