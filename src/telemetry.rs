use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Escape byte framing every telemetry stream.
pub const TLM_ESCAPE: u8 = 0x1F;
pub const TLM_START: u8 = 0x7F;
pub const TLM_END: u8 = 0xFF;

pub const TLM_ID_V1: u8 = 0x01;
pub const TLM_ID_V2: u8 = 0x02;
pub const TLM_ID_OBC_TEMP: u8 = 0x03;

/// Largest environmental frame the builder can produce.
pub const MAX_FRAME_SIZE: usize = 50;

pub type FrameBuffer = ArrayVec<u8, MAX_FRAME_SIZE>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("output channel still busy after {0} attempts")]
    Busy(u32),
    #[error("output channel failed: {0}")]
    Failed(String),
}

/// Byte-oriented output toward the radio or a debug console.
///
/// `WouldBlock` reports a transient busy channel; callers retry through
/// [`transmit_with_retry`].
pub trait TelemetrySink: Send + Sync {
    fn transmit(&self, bytes: &[u8]) -> nb::Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_backoff_ms: 10,
        }
    }
}

/// Transmits `bytes`, backing off exponentially while the sink reports busy.
pub async fn transmit_with_retry(
    sink: &dyn TelemetrySink,
    bytes: &[u8],
    policy: RetryPolicy,
) -> Result<(), SinkError> {
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.base_backoff();

    for attempt in 1..=attempts {
        match sink.transmit(bytes) {
            Ok(()) => return Ok(()),
            Err(nb::Error::Other(e)) => return Err(e),
            Err(nb::Error::WouldBlock) => {
                debug!(attempt, ?backoff, "telemetry sink busy");
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    warn!(attempts, len = bytes.len(), "giving up on busy telemetry sink");
    Err(SinkError::Busy(attempts))
}

/// A transmitted frame, as recorded or forwarded by the provided sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

impl TelemetryFrame {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }
}

/// Records every frame; can be told to report busy for the next N calls.
#[derive(Debug, Default)]
pub struct MemorySink {
    frames: Mutex<Vec<TelemetryFrame>>,
    busy_for: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `calls` transmissions return `WouldBlock`.
    pub fn busy_for(&self, calls: u32) {
        self.busy_for.store(calls, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<TelemetryFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<TelemetryFrame> {
        std::mem::take(&mut *self.frames.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn contains(&self, bytes: &[u8]) -> bool {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|f| f.bytes == bytes)
    }
}

impl TelemetrySink for MemorySink {
    fn transmit(&self, bytes: &[u8]) -> nb::Result<(), SinkError> {
        let busy = self
            .busy_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if busy.is_ok() {
            return Err(nb::Error::WouldBlock);
        }

        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TelemetryFrame::new(bytes));
        Ok(())
    }
}

/// Forwards frames to an async consumer, e.g. the simulator's printer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TelemetryFrame>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TelemetryFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn transmit(&self, bytes: &[u8]) -> nb::Result<(), SinkError> {
        self.tx
            .send(TelemetryFrame::new(bytes))
            .map_err(|_| nb::Error::Other(SinkError::Failed("receiver dropped".into())))
    }
}

/// Writes each frame to the log as hex.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn transmit(&self, bytes: &[u8]) -> nb::Result<(), SinkError> {
        info!(len = bytes.len(), frame = %hex(bytes), "downlink");
        Ok(())
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalogChannel {
    Voltage1,
    Voltage2,
}

/// Analog front end sampled by the environmental telemetry stream.
pub trait AnalogSource: Send + Sync {
    fn read(&self, channel: AnalogChannel) -> u16;
    fn obc_temperature(&self) -> f32;
}

/// Constant readings, for tests and the simulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedAnalog {
    pub voltage1: u16,
    pub voltage2: u16,
    pub temperature_c: f32,
}

impl FixedAnalog {
    pub fn new(voltage1: u16, voltage2: u16, temperature_c: f32) -> Self {
        Self {
            voltage1,
            voltage2,
            temperature_c,
        }
    }
}

impl Default for FixedAnalog {
    fn default() -> Self {
        Self::new(3300, 5000, 21.5)
    }
}

impl AnalogSource for FixedAnalog {
    fn read(&self, channel: AnalogChannel) -> u16 {
        match channel {
            AnalogChannel::Voltage1 => self.voltage1,
            AnalogChannel::Voltage2 => self.voltage2,
        }
    }

    fn obc_temperature(&self) -> f32 {
        self.temperature_c
    }
}

/// Items included in each environmental telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySelection {
    pub voltage1: bool,
    pub voltage2: bool,
    pub obc_temperature: bool,
}

impl Default for TelemetrySelection {
    fn default() -> Self {
        Self {
            voltage1: true,
            voltage2: true,
            obc_temperature: true,
        }
    }
}

/// Builds `ESC SOM [id value]* ESC EOM` frames, values little-endian.
#[derive(Debug, Clone)]
pub struct TelemetryFrameBuilder {
    buffer: FrameBuffer,
}

impl TelemetryFrameBuilder {
    pub fn new() -> Self {
        let mut buffer = FrameBuffer::new();
        buffer.push(TLM_ESCAPE);
        buffer.push(TLM_START);
        Self { buffer }
    }

    #[must_use]
    pub fn item_u16(mut self, id: u8, value: u16) -> Self {
        self.push_item(id, &value.to_le_bytes());
        self
    }

    #[must_use]
    pub fn item_f32(mut self, id: u8, value: f32) -> Self {
        self.push_item(id, &value.to_le_bytes());
        self
    }

    pub fn finish(mut self) -> FrameBuffer {
        // NASA Rule 5: Safety assertion for frame capacity
        debug_assert!(self.buffer.remaining_capacity() >= 2);
        let _ = self.buffer.try_extend_from_slice(&[TLM_ESCAPE, TLM_END]);
        self.buffer
    }

    fn push_item(&mut self, id: u8, value: &[u8]) {
        // Trailer space is reserved; an item that would not fit is dropped.
        if self.buffer.remaining_capacity() < 1 + value.len() + 2 {
            warn!(id, "telemetry frame full, item dropped");
            return;
        }
        self.buffer.push(id);
        let _ = self.buffer.try_extend_from_slice(value);
    }
}

impl Default for TelemetryFrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Samples the analog front end into one environmental frame.
pub fn environment_frame(selection: TelemetrySelection, analog: &dyn AnalogSource) -> FrameBuffer {
    let mut builder = TelemetryFrameBuilder::new();
    if selection.voltage1 {
        builder = builder.item_u16(TLM_ID_V1, analog.read(AnalogChannel::Voltage1));
    }
    if selection.voltage2 {
        builder = builder.item_u16(TLM_ID_V2, analog.read(AnalogChannel::Voltage2));
    }
    if selection.obc_temperature {
        builder = builder.item_f32(TLM_ID_OBC_TEMP, analog.obc_temperature());
    }
    builder.finish()
}
