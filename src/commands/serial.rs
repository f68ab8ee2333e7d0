use std::sync::Arc;

use async_trait::async_trait;

use super::CommandHandler;
use crate::clock::Clock;
use crate::ingest::SerialIngestor;
use crate::types::{CommandRequest, CommandResult};

/// Device command behind each routed command name.
pub fn serial_command_for(command: &str) -> Option<&'static str> {
    match command {
        "vrx/tune" => Some("SET_VRX_FREQ"),
        "scan/start" => Some("START_SCAN"),
        "scan/stop" => Some("STOP_SCAN"),
        "video/select" => Some("VIDEO_SELECT"),
        _ => None,
    }
}

/// Forwards tuning, scan and video commands to the VRX microcontroller.
pub struct SerialCommandHandler {
    ingestor: Arc<SerialIngestor>,
    clock: Arc<dyn Clock>,
}

impl SerialCommandHandler {
    pub fn new(ingestor: Arc<SerialIngestor>, clock: Arc<dyn Clock>) -> Self {
        Self { ingestor, clock }
    }
}

#[async_trait]
impl CommandHandler for SerialCommandHandler {
    fn can_handle(&self, command: &str) -> bool {
        serial_command_for(command).is_some()
    }

    async fn handle(&self, request: CommandRequest) -> CommandResult {
        match serial_command_for(&request.command) {
            Some(cmd) => self.ingestor.send_command(cmd, &request.payload).await,
            None => CommandResult::rejected(request.command, "unsupported", self.clock.now_ms()),
        }
    }
}
