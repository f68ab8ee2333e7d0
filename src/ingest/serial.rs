//! VRX Microcontroller Serial Link
//!
//! Newline-delimited JSON in both directions over a USB serial device.
//!
//! ## Inbound
//!
//! - `telemetry`: receiver channels, LEDs, system facts, video selection
//! - `command_ack`: `{id, ok, err}` answering an outbound command
//! - `log_event`: free-form device log record
//!
//! ## Outbound
//!
//! `{id, cmd, args}`, where `id` is a fresh correlation id per attempt. A caller
//! waits for the matching `command_ack` up to the command timeout, retrying
//! with a new id until the retry budget is spent. Acks that arrive after
//! their attempt timed out match no pending entry and are only republished.
//!
//! The device handle is owned by the reconnect loop. Reads run in that loop;
//! writes go through a separate write lock so lines never interleave. The
//! tty is opened non-blocking and polled through the reactor, so stopping
//! the loop closes the device without waiting on a pending read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{BackgroundTask, HealthTracker, IngestError, Ingestor, IngestorHealth};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::SerialConfig;
use crate::contacts::ContactFusion;
use crate::state::{Section, StateStore};
use crate::types::{event_types, json_timestamp, new_command_id, CommandResult, EventEnvelope, JsonMap};

pub const SERIAL_SOURCE: &str = "esp32";

/// Detail reported when a command is issued without a live link.
pub const NOT_CONNECTED: &str = "serial_not_connected";

/// Detail reported when every attempt went unacknowledged.
pub const TIMEOUT: &str = "timeout";

/// Serial link errors
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial device closed")]
    Closed,

    #[error("serial link not connected")]
    NotConnected,
}

// ============================================================================
// Settings & device access
// ============================================================================

/// Runtime parameters for the serial link.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Fallback device path
    pub port: PathBuf,
    /// Directory of OS-stable symlinks, preferred when non-empty
    pub by_id_dir: Option<PathBuf>,
    pub baud_rate: u32,
    pub reconnect_delay: Duration,
    pub command_timeout: Duration,
    /// Extra attempts after the first
    pub command_retries: u32,
    pub max_line_bytes: usize,
    pub read_chunk_bytes: usize,
}

impl From<&SerialConfig> for SerialSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            port: PathBuf::from(&config.port),
            by_id_dir: config.by_id_dir.as_ref().map(PathBuf::from),
            baud_rate: config.baud_rate,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            command_retries: config.command_retries,
            max_line_bytes: config.max_line_bytes,
            read_chunk_bytes: config.read_chunk_bytes,
        }
    }
}

pub type SerialReader = Box<dyn AsyncRead + Send + Unpin>;
pub type SerialWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Independent read and write halves of an opened device.
pub struct SerialStream {
    pub reader: SerialReader,
    pub writer: SerialWriter,
}

/// Opens the device behind a resolved path.
#[async_trait]
pub trait SerialConnector: Send + Sync + 'static {
    async fn open(&self, device: &Path) -> Result<SerialStream, SerialError>;
}

/// Opens a tty in raw mode at a fixed baud rate.
#[derive(Debug, Clone)]
pub struct TtyConnector {
    baud_rate: u32,
}

impl TtyConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

#[async_trait]
impl SerialConnector for TtyConnector {
    async fn open(&self, device: &Path) -> Result<SerialStream, SerialError> {
        let path = device.to_path_buf();
        let baud_rate = self.baud_rate;
        let opened = tokio::task::spawn_blocking(move || open_tty(&path, baud_rate))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|r| r)
            .and_then(TtyPort::split);
        opened.map_err(|source| SerialError::Open {
            path: device.to_path_buf(),
            source,
        })
    }
}

fn open_tty(path: &Path, baud_rate: u32) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK);
    }
    let file = options.open(path)?;
    #[cfg(unix)]
    configure_raw(&file, baud_rate)?;
    #[cfg(not(unix))]
    let _ = baud_rate;
    Ok(file)
}

/// Non-blocking tty registered with the reactor.
///
/// Both halves share one descriptor; it closes when the reader and the
/// writer are dropped. Pending reads are plain readiness waits, so dropping
/// the read future releases the device at once.
#[cfg(unix)]
#[derive(Clone)]
struct TtyPort {
    fd: Arc<tokio::io::unix::AsyncFd<std::fs::File>>,
}

#[cfg(unix)]
impl TtyPort {
    fn split(file: std::fs::File) -> std::io::Result<SerialStream> {
        let port = Self {
            fd: Arc::new(tokio::io::unix::AsyncFd::new(file)?),
        };
        Ok(SerialStream {
            reader: Box::new(port.clone()),
            writer: Box::new(port),
        })
    }
}

#[cfg(not(unix))]
struct TtyPort;

#[cfg(not(unix))]
impl TtyPort {
    fn split(_file: std::fs::File) -> std::io::Result<SerialStream> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "serial devices are only supported on unix",
        ))
    }
}

#[cfg(unix)]
impl AsyncRead for TtyPort {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::io::Read;
        loop {
            let mut guard = std::task::ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return std::task::Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return std::task::Poll::Ready(Err(e)),
                Err(_would_block) => {}
            }
        }
    }
}

#[cfg(unix)]
impl AsyncWrite for TtyPort {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        use std::io::Write;
        loop {
            let mut guard = std::task::ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(buf)
            }) {
                Ok(result) => return std::task::Poll::Ready(result),
                Err(_would_block) => {}
            }
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(unix)]
fn baud_constant(baud_rate: u32) -> Option<libc::speed_t> {
    match baud_rate {
        9_600 => Some(libc::B9600),
        19_200 => Some(libc::B19200),
        38_400 => Some(libc::B38400),
        57_600 => Some(libc::B57600),
        115_200 => Some(libc::B115200),
        230_400 => Some(libc::B230400),
        #[cfg(target_os = "linux")]
        460_800 => Some(libc::B460800),
        #[cfg(target_os = "linux")]
        921_600 => Some(libc::B921600),
        _ => None,
    }
}

/// Put the tty in raw 8N1 mode at `baud_rate`. Non-tty files are left alone.
#[cfg(unix)]
#[allow(unsafe_code)]
fn configure_raw(file: &std::fs::File, baud_rate: u32) -> std::io::Result<()> {
    use std::mem::MaybeUninit;
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let mut tio = MaybeUninit::<libc::termios>::uninit();
    if unsafe { libc::tcgetattr(fd, tio.as_mut_ptr()) } != 0 {
        debug!("Device is not a tty, skipping line configuration");
        return Ok(());
    }
    let mut tio = unsafe { tio.assume_init() };
    let speed = baud_constant(baud_rate).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported baud rate {baud_rate}"),
        )
    })?;

    unsafe {
        libc::cfmakeraw(&mut tio);
        libc::cfsetispeed(&mut tio, speed);
        libc::cfsetospeed(&mut tio, speed);
    }
    tio.c_cflag |= libc::CLOCAL | libc::CREAD;
    tio.c_cc[libc::VMIN] = 1;
    tio.c_cc[libc::VTIME] = 0;

    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Pick the device to open: first stable symlink if any, else the configured port.
pub async fn resolve_device(settings: &SerialSettings) -> PathBuf {
    if let Some(dir) = &settings.by_id_dir {
        if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
            let mut candidates = Vec::new();
            while let Ok(Some(entry)) = entries.next_entry().await {
                candidates.push(entry.path());
            }
            candidates.sort();
            if let Some(first) = candidates.into_iter().next() {
                return first;
            }
        }
    }
    settings.port.clone()
}

// ============================================================================
// Line framing
// ============================================================================

/// Splits a byte stream into newline-terminated lines.
///
/// A line longer than `max_line_bytes` means the stream is likely corrupt;
/// the whole buffer is discarded.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_bytes: usize,
    overflows: u64,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            overflows: 0,
        }
    }

    /// Feed a chunk; returns the complete, trimmed, non-empty lines it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            if pos > self.max_line_bytes {
                self.overflow();
                return lines;
            }
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        if self.buffer.len() > self.max_line_bytes {
            self.overflow();
        }
        lines
    }

    fn overflow(&mut self) {
        warn!(
            buffered = self.buffer.len(),
            max_line_bytes = self.max_line_bytes,
            "Serial line exceeds maximum length, discarding buffer"
        );
        self.buffer.clear();
        self.overflows += 1;
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}

// ============================================================================
// Shared link state
// ============================================================================

/// Device response to one command attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    pub ok: bool,
    pub err: Option<String>,
}

impl CommandAck {
    fn from_message(message: &JsonMap) -> Self {
        let err = match message.get("err") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        Self {
            ok: message.get("ok").and_then(Value::as_bool).unwrap_or(false),
            err,
        }
    }
}

#[derive(Default)]
struct LinkState {
    connected: bool,
    device: Option<PathBuf>,
    /// Correlation id → waiting caller
    pending: HashMap<String, oneshot::Sender<CommandAck>>,
}

enum AttemptOutcome {
    Acked(CommandAck),
    TimedOut,
    Failed(SerialError),
}

struct SerialShared {
    settings: SerialSettings,
    connector: Arc<dyn SerialConnector>,
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    fusion: Option<Arc<ContactFusion>>,
    clock: Arc<dyn Clock>,
    health: HealthTracker,
    link: Mutex<LinkState>,
    writer: tokio::sync::Mutex<Option<SerialWriter>>,
}

impl SerialShared {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        self.link().connected
    }

    fn pending_count(&self) -> usize {
        self.link().pending.len()
    }

    async fn attach(&self, writer: SerialWriter, device: &Path) {
        *self.writer.lock().await = Some(writer);
        let mut link = self.link();
        link.connected = true;
        link.device = Some(device.to_path_buf());
    }

    async fn detach(&self) {
        {
            let mut link = self.link();
            link.connected = false;
        }
        *self.writer.lock().await = None;
    }

    // ------------------------------------------------------------------
    // Reconnect / read loop
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            port = %self.settings.port.display(),
            baud = self.settings.baud_rate,
            "Serial link loop started"
        );
        loop {
            let device = resolve_device(&self.settings).await;
            let opened = tokio::select! {
                () = cancel.cancelled() => break,
                opened = self.connector.open(&device) => opened,
            };

            match opened {
                Ok(stream) => {
                    info!(device = %device.display(), "Serial device connected");
                    self.attach(stream.writer, &device).await;
                    let result = self.read_loop(stream.reader, &cancel).await;
                    self.detach().await;
                    match result {
                        Ok(()) => break,
                        Err(e) => {
                            warn!(device = %device.display(), error = %e, "Serial link lost, reconnecting");
                            self.health.record_error(e);
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Serial open failed");
                    self.health.record_error(e);
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
        self.detach().await;
    }

    /// Read until cancelled (`Ok`) or the link fails (`Err`).
    async fn read_loop(&self, mut reader: SerialReader, cancel: &CancellationToken) -> Result<(), SerialError> {
        let mut framer = LineFramer::new(self.settings.max_line_bytes);
        let mut chunk = vec![0u8; self.settings.read_chunk_bytes.max(1)];
        loop {
            let n = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                n = reader.read(&mut chunk) => n?,
            };
            if n == 0 {
                return Err(SerialError::Closed);
            }
            for line in framer.push(&chunk[..n]) {
                self.handle_line(&line).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    async fn handle_line(&self, line: &str) {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(message)) => {
                self.handle_message(message).await;
                self.health.record_success();
            }
            Ok(_) => trace!("Ignoring non-object serial message"),
            Err(e) => trace!(error = %e, "Ignoring undecodable serial line"),
        }
    }

    async fn handle_message(&self, message: JsonMap) {
        let timestamp_ms = json_timestamp(message.get("timestamp_ms")).unwrap_or_else(|| self.clock.now_ms());
        match message.get("type").and_then(Value::as_str) {
            Some("telemetry") => self.handle_telemetry(message, timestamp_ms).await,
            Some("command_ack") => {
                if let Some(id) = message.get("id").and_then(Value::as_str) {
                    self.resolve(id, CommandAck::from_message(&message));
                }
                self.publish(event_types::COMMAND_ACK, timestamp_ms, message);
            }
            Some("log_event") => self.publish(event_types::LOG_EVENT, timestamp_ms, message),
            other => debug!(message_type = ?other, "Unhandled serial message type"),
        }
    }

    async fn handle_telemetry(&self, message: JsonMap, timestamp_ms: u64) {
        let field = |key: &str| message.get(key).cloned().unwrap_or(Value::Null);
        self.state
            .update(
                Section::Vrx,
                json!({
                    "selected": field("sel"),
                    "vrx": message.get("vrx").cloned().unwrap_or_else(|| json!([])),
                    "led": field("led"),
                    "sys": field("sys"),
                    "timestamp_ms": timestamp_ms,
                }),
            )
            .await;
        let video = match message.get("video") {
            Some(Value::Object(video)) => Value::Object(video.clone()),
            Some(Value::Null) | None => json!({}),
            Some(other) => json!({ "selected": other }),
        };
        self.state.update(Section::Video, video).await;

        if let Some(fusion) = &self.fusion {
            fusion.update_fpv(&message, timestamp_ms).await;
        }
        self.publish(event_types::ESP32_TELEMETRY, timestamp_ms, message);
    }

    fn publish(&self, event_type: &str, timestamp_ms: u64, data: JsonMap) {
        self.bus
            .publish(EventEnvelope::new(event_type, timestamp_ms, SERIAL_SOURCE, data));
    }

    /// Hand an ack to its waiting caller, if the attempt is still pending.
    fn resolve(&self, id: &str, ack: CommandAck) {
        let waiter = self.link().pending.remove(id);
        match waiter {
            Some(tx) => {
                if tx.send(ack).is_err() {
                    debug!(id, "Command waiter gone before ack delivery");
                }
            }
            None => debug!(id, "Ack with no pending command"),
        }
    }

    // ------------------------------------------------------------------
    // Outbound commands
    // ------------------------------------------------------------------

    async fn write_command(&self, id: &str, cmd: &str, args: &JsonMap) -> Result<(), SerialError> {
        let mut line = json!({"id": id, "cmd": cmd, "args": Value::Object(args.clone())}).to_string();
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(SerialError::NotConnected)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        trace!(id, cmd, "Command written");
        Ok(())
    }

    async fn attempt(&self, id: &str, cmd: &str, args: &JsonMap) -> AttemptOutcome {
        let (tx, rx) = oneshot::channel();
        self.link().pending.insert(id.to_string(), tx);

        let outcome = match self.write_command(id, cmd, args).await {
            Err(e) => AttemptOutcome::Failed(e),
            Ok(()) => match tokio::time::timeout(self.settings.command_timeout, rx).await {
                Ok(Ok(ack)) => AttemptOutcome::Acked(ack),
                Ok(Err(_)) | Err(_) => AttemptOutcome::TimedOut,
            },
        };

        self.link().pending.remove(id);
        outcome
    }

    fn failure(&self, cmd: &str, command_id: String, detail: &str) -> CommandResult {
        let now = self.clock.now_ms();
        let mut data = JsonMap::new();
        data.insert("id".into(), json!(&command_id));
        data.insert("cmd".into(), json!(cmd));
        data.insert("ok".into(), json!(false));
        data.insert("err".into(), json!(detail));
        self.publish(event_types::COMMAND_ACK, now, data);
        CommandResult::new(cmd, command_id, false, Some(detail.to_string()), now)
    }

    async fn send_command(&self, cmd: &str, args: &JsonMap) -> CommandResult {
        if !self.is_connected() {
            warn!(cmd, "Command rejected, serial link down");
            return self.failure(cmd, new_command_id(), NOT_CONNECTED);
        }

        let attempts = self.settings.command_retries.saturating_add(1);
        let mut last_id = String::new();
        for attempt in 1..=attempts {
            let id = new_command_id();
            match self.attempt(&id, cmd, args).await {
                AttemptOutcome::Acked(ack) => {
                    debug!(cmd, id = %id, ok = ack.ok, attempt, "Command acknowledged");
                    return CommandResult::new(cmd, id, ack.ok, ack.err, self.clock.now_ms());
                }
                AttemptOutcome::TimedOut => {
                    warn!(cmd, id = %id, attempt, attempts, "Command ack timed out");
                    last_id = id;
                }
                AttemptOutcome::Failed(SerialError::NotConnected) => {
                    return self.failure(cmd, id, NOT_CONNECTED);
                }
                AttemptOutcome::Failed(e) => {
                    warn!(cmd, id = %id, error = %e, "Command write failed");
                    self.health.record_error(&e);
                    return self.failure(cmd, id, &e.to_string());
                }
            }
        }
        self.failure(cmd, last_id, TIMEOUT)
    }
}

// ============================================================================
// Ingestor
// ============================================================================

/// Serial link ingestor with reconnect loop and command protocol.
pub struct SerialIngestor {
    shared: Arc<SerialShared>,
    task: BackgroundTask,
}

impl SerialIngestor {
    pub fn new(
        settings: SerialSettings,
        connector: Arc<dyn SerialConnector>,
        state: Arc<StateStore>,
        bus: Arc<EventBus>,
        fusion: Option<Arc<ContactFusion>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task: BackgroundTask::new("serial"),
            shared: Arc::new(SerialShared {
                settings,
                connector,
                state,
                bus,
                fusion,
                health: HealthTracker::new(Arc::clone(&clock)),
                clock,
                link: Mutex::new(LinkState::default()),
                writer: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Outstanding command attempts awaiting an ack.
    pub fn pending_commands(&self) -> usize {
        self.shared.pending_count()
    }

    /// Send `cmd` with `args` and wait for the device's acknowledgement.
    ///
    /// Never fails across the boundary: link loss and timeouts come back as a
    /// non-accepted result (and a COMMAND_ACK failure event).
    pub async fn send_command(&self, cmd: &str, args: &JsonMap) -> CommandResult {
        self.shared.send_command(cmd, args).await
    }

    /// Process one raw line as the read loop would.
    pub async fn handle_line(&self, line: &str) {
        self.shared.handle_line(line).await;
    }
}

#[async_trait]
impl Ingestor for SerialIngestor {
    fn name(&self) -> &str {
        "serial"
    }

    async fn start(&self) -> Result<(), IngestError> {
        let shared = Arc::clone(&self.shared);
        self.task.start(move |cancel| shared.run(cancel)).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), IngestError> {
        self.task.stop().await
    }

    async fn health(&self) -> IngestorHealth {
        let mut report = self.shared.health.report(self.task.is_running().await);
        let link = self.shared.link();
        report.details.insert("connected".into(), json!(link.connected));
        if let Some(device) = &link.device {
            report
                .details
                .insert("device".into(), json!(device.display().to_string()));
        }
        report
    }
}
