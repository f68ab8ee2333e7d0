//! Command routing
//!
//! A [`CommandRouter`] walks its handlers in registration order and hands the
//! request to the first one that claims the command name. Handlers never fail
//! across this boundary: every outcome, including rejection, is a
//! [`CommandResult`].

mod serial;
mod system;

pub use serial::{serial_command_for, SerialCommandHandler};
pub use system::SystemCommandHandler;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::types::{CommandRequest, CommandResult};

/// Detail of the result synthesized when no handler claims a command.
pub const NO_HANDLER: &str = "No handler registered for command";

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn can_handle(&self, command: &str) -> bool;

    async fn handle(&self, request: CommandRequest) -> CommandResult;
}

/// Ordered set of command handlers.
pub struct CommandRouter {
    handlers: Vec<Arc<dyn CommandHandler>>,
    clock: Arc<dyn Clock>,
}

impl CommandRouter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            handlers: Vec::new(),
            clock,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub async fn dispatch(&self, request: CommandRequest) -> CommandResult {
        match self.handlers.iter().find(|h| h.can_handle(&request.command)) {
            Some(handler) => {
                debug!(
                    command = %request.command,
                    issued_by = request.issued_by.as_deref().unwrap_or("-"),
                    "Dispatching command"
                );
                handler.handle(request).await
            }
            None => {
                warn!(command = %request.command, "No handler for command");
                CommandResult::rejected(request.command, NO_HANDLER, self.clock.now_ms())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for Fixed {
        fn can_handle(&self, command: &str) -> bool {
            command.starts_with("scan/")
        }

        async fn handle(&self, request: CommandRequest) -> CommandResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            CommandResult::new(request.command, self.name, true, Some("done".into()), 7)
        }
    }

    fn fixed(name: &'static str) -> Arc<Fixed> {
        Arc::new(Fixed {
            name,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_unregistered_command_rejected() {
        let router = CommandRouter::new(Arc::new(ManualClock::new(500)));
        let result = router.dispatch(CommandRequest::new("nope")).await;
        assert!(!result.accepted);
        assert_eq!(result.command, "nope");
        assert_eq!(result.detail.as_deref(), Some(NO_HANDLER));
        assert_eq!(result.timestamp_ms, 500);
        assert!(!result.command_id.is_empty());
    }

    #[tokio::test]
    async fn test_first_matching_handler_result_returned_verbatim() {
        let mut router = CommandRouter::new(Arc::new(ManualClock::new(0)));
        let first = fixed("first");
        let second = fixed("second");
        router.register(first.clone());
        router.register(second.clone());
        assert_eq!(router.handler_count(), 2);

        let result = router.dispatch(CommandRequest::new("scan/start")).await;
        assert_eq!(
            result,
            CommandResult::new("scan/start", "first", true, Some("done".into()), 7)
        );
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }
}
