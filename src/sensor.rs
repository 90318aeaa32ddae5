//! Particulate sensor access.
//!
//! [`SampleSource`] is the single-attempt transport capability; [`Pms5003`]
//! implements it for a Plantower PMS5003 on a serial line. [`SensorReader`]
//! turns unreliable attempts into one blocking `read_sample` call:
//!
//! - a fixed delay precedes every attempt, with no backoff
//! - transient failures are retried forever
//! - once more than `escalation_threshold` consecutive failures have happened
//!   within one call, exactly one warning event goes to the [`LogSink`]
//! - fatal transport errors and cancellation end the call

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_serial::{
    DataBits, ErrorKind as SerialErrorKind, FlowControl, Parity, SerialPortBuilderExt,
    SerialStream, StopBits,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::LogSink;
use crate::config::AgentSettings;
use crate::model::{LogEvent, Sample};

/// Size of a PMS5003 frame including start bytes and checksum.
pub const FRAME_LEN: usize = 32;

const BAUD_RATE: u32 = 9600;

const FRAME_START: [u8; 2] = [0x42, 0x4D];

/// Value of the length field: 13 data words plus the checksum.
const FRAME_BODY_LEN: u16 = 28;

/// Bytes skipped while looking for a frame start before giving up.
const MAX_SCAN_BYTES: usize = 2 * FRAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Worth retrying: timeout, framing or checksum problem.
    #[error("transient sensor error: {0}")]
    Transient(String),

    /// Retrying cannot help, e.g. the device node does not exist.
    #[error("sensor unavailable: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Why [`SensorReader::read_sample`] returned without a sample.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error(transparent)]
    Transport(TransportError),

    #[error("sensor read cancelled")]
    Cancelled,
}

#[async_trait]
pub trait SampleSource: Send {
    async fn read(&mut self) -> Result<Sample, TransportError>;
}

/// Timing of [`SensorReader`] retries.
///
/// There is intentionally no attempt limit: the reader keeps trying until a
/// sample arrives or it is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,

    pub escalation_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            escalation_threshold: 100,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            delay: settings.retry_delay,
            escalation_threshold: settings.escalation_threshold,
        }
    }
}

pub struct SensorReader<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: SampleSource> SensorReader<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Block until the sensor produces a sample.
    ///
    /// # Errors
    ///
    /// `SensorError::Transport` for a fatal transport error and
    /// `SensorError::Cancelled` once `cancel` fires. Transient errors never
    /// surface.
    pub async fn read_sample(
        &mut self,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<Sample, SensorError> {
        let mut consecutive_failures: u32 = 0;
        let mut escalated = false;

        info!("Reading PM data");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SensorError::Cancelled),
                _ = tokio::time::sleep(self.policy.delay) => {}
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SensorError::Cancelled),
                result = self.transport.read() => result,
            };

            match attempt {
                Ok(sample) => {
                    if consecutive_failures > 0 {
                        debug!(consecutive_failures, "Sensor recovered");
                    }
                    return Ok(sample);
                }
                Err(e) if e.is_transient() => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(error = %e, consecutive_failures, "Unable to read from PM sensor, retrying");

                    if consecutive_failures > self.policy.escalation_threshold && !escalated {
                        escalated = true;
                        error!(consecutive_failures, "Excessive PM sensor read failures");
                        sink.submit_log(&LogEvent::excessive_read_failure(
                            self.policy.escalation_threshold,
                        ))
                        .await;
                    }
                }
                Err(e) => {
                    error!(error = %e, consecutive_failures, "PM sensor failed permanently");
                    return Err(SensorError::Transport(e));
                }
            }
        }
    }
}

/// PMS5003 attached to a serial line at 9600 8N1.
///
/// The port is opened afresh for every attempt so frames queued up while the
/// agent slept are never reported as current. Reads are non-blocking, so an
/// attempt that times out leaves nothing behind on the line.
#[derive(Debug, Clone)]
pub struct Pms5003 {
    device: PathBuf,
    frame_timeout: Duration,
}

impl Pms5003 {
    pub fn new(device: impl Into<PathBuf>, frame_timeout: Duration) -> Self {
        Self {
            device: device.into(),
            frame_timeout,
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(settings.sensor_device.clone(), settings.sensor_timeout)
    }

    fn open(&self) -> Result<SerialStream, TransportError> {
        tokio_serial::new(self.device.to_string_lossy(), BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.frame_timeout)
            .open_native_async()
            .map_err(|e| {
                let message = format!("{}: {}", self.device.display(), e);
                match e.kind() {
                    SerialErrorKind::NoDevice
                    | SerialErrorKind::Io(ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                        TransportError::Fatal(message)
                    }
                    _ => TransportError::Transient(message),
                }
            })
    }
}

#[async_trait]
impl SampleSource for Pms5003 {
    async fn read(&mut self) -> Result<Sample, TransportError> {
        let mut port = self.open()?;
        read_frame_within(&mut port, self.frame_timeout).await
    }
}

/// [`read_frame`] bounded by `limit`.
pub async fn read_frame_within<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: Duration,
) -> Result<Sample, TransportError> {
    match tokio::time::timeout(limit, read_frame(reader)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Transient(format!(
            "no frame within {:?}",
            limit
        ))),
    }
}

/// Read the next complete frame from a byte stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Sample, TransportError> {
    let mut frame = [0u8; FRAME_LEN];
    let mut previous: Option<u8> = None;
    let mut scanned = 0;

    loop {
        let byte = reader.read_u8().await.map_err(io_error)?;
        if previous == Some(FRAME_START[0]) && byte == FRAME_START[1] {
            break;
        }
        previous = Some(byte);
        scanned += 1;
        if scanned > MAX_SCAN_BYTES {
            return Err(TransportError::Transient("no start of frame".to_string()));
        }
    }

    frame[..2].copy_from_slice(&FRAME_START);
    reader.read_exact(&mut frame[2..]).await.map_err(io_error)?;
    parse_frame(&frame)
}

fn io_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::UnexpectedEof => TransportError::Transient("incomplete frame".to_string()),
        _ => TransportError::Transient(e.to_string()),
    }
}

pub fn parse_frame(frame: &[u8; FRAME_LEN]) -> Result<Sample, TransportError> {
    if frame[..2] != FRAME_START {
        return Err(TransportError::Transient("bad frame start".to_string()));
    }

    let word = |index: usize| u16::from_be_bytes([frame[index], frame[index + 1]]);

    let length = word(2);
    if length != FRAME_BODY_LEN {
        return Err(TransportError::Transient(format!(
            "bad frame length {}",
            length
        )));
    }

    let expected = word(FRAME_LEN - 2);
    let actual = frame[..FRAME_LEN - 2]
        .iter()
        .fold(0u16, |sum, b| sum.wrapping_add(*b as u16));
    if expected != actual {
        return Err(TransportError::Transient(format!(
            "checksum mismatch: expected {:#06x}, got {:#06x}",
            expected, actual
        )));
    }

    // Data words start at byte 4: three standard-particle values, then the
    // three environmental ones.
    Ok(Sample::new(word(10), word(12), word(14)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use tokio::io::AsyncWriteExt;

    use crate::model::{LogCode, Severity};
    use crate::test_support::{RecordingSink, ScriptedSource};

    /// Build a valid frame with the given environmental readings.
    fn build_frame(pm1_0: u16, pm2_5: u16, pm10: u16) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = 0x42;
        frame[1] = 0x4D;
        frame[2..4].copy_from_slice(&FRAME_BODY_LEN.to_be_bytes());
        // Standard-particle values differ from the environmental ones.
        frame[4..6].copy_from_slice(&(pm1_0 + 100).to_be_bytes());
        frame[6..8].copy_from_slice(&(pm2_5 + 100).to_be_bytes());
        frame[8..10].copy_from_slice(&(pm10 + 100).to_be_bytes());
        frame[10..12].copy_from_slice(&pm1_0.to_be_bytes());
        frame[12..14].copy_from_slice(&pm2_5.to_be_bytes());
        frame[14..16].copy_from_slice(&pm10.to_be_bytes());
        let checksum = frame[..30].iter().fold(0u16, |s, b| s.wrapping_add(*b as u16));
        frame[30..32].copy_from_slice(&checksum.to_be_bytes());
        frame
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            delay: Duration::ZERO,
            escalation_threshold: 100,
        }
    }

    #[test]
    fn test_parse_frame_uses_environmental_values() {
        let sample = parse_frame(&build_frame(5, 9, 14)).unwrap();
        assert_eq!((sample.pm1_0, sample.pm2_5, sample.pm10), (5, 9, 14));
    }

    #[test]
    fn test_parse_frame_rejects_bad_checksum() {
        let mut frame = build_frame(5, 9, 14);
        frame[13] ^= 0xFF;
        let err = parse_frame(&frame).unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_parse_frame_rejects_bad_length() {
        let mut frame = build_frame(5, 9, 14);
        frame[3] = 20;
        assert!(parse_frame(&frame).unwrap_err().to_string().contains("length"));
    }

    #[tokio::test]
    async fn test_read_frame_skips_leading_garbage() {
        let mut bytes = vec![0x00, 0x42, 0x13, 0x4D, 0x07];
        bytes.extend_from_slice(&build_frame(1, 2, 3));
        let mut reader = bytes.as_slice();

        let sample = read_frame(&mut reader).await.unwrap();
        assert_eq!((sample.pm1_0, sample.pm2_5, sample.pm10), (1, 2, 3));
    }

    #[tokio::test]
    async fn test_read_frame_incomplete() {
        let frame = build_frame(1, 2, 3);
        let mut reader = &frame[..20];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err, TransportError::Transient("incomplete frame".to_string()));
    }

    #[tokio::test]
    async fn test_read_frame_without_start() {
        let bytes = vec![0x11u8; 3 * FRAME_LEN];
        let mut reader = bytes.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err, TransportError::Transient("no start of frame".to_string()));
    }

    #[tokio::test]
    async fn test_missing_device_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sensor = Pms5003::new(dir.path().join("ttyNONE"), Duration::from_millis(50));
        assert!(matches!(sensor.read().await, Err(TransportError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_regular_file_is_not_a_serial_line() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("ttyFAKE");
        std::fs::write(&device, build_frame(8, 16, 24)).unwrap();

        let mut sensor = Pms5003::new(&device, Duration::from_millis(50));
        assert!(matches!(sensor.read().await, Err(TransportError::Transient(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_line_then_frame() {
        let (mut sensor_side, mut line) = tokio::io::duplex(FRAME_LEN * 2);

        for _ in 0..3 {
            let err = read_frame_within(&mut line, Duration::from_millis(50))
                .await
                .unwrap_err();
            assert_eq!(err, TransportError::Transient("no frame within 50ms".to_string()));
        }

        sensor_side.write_all(&build_frame(4, 5, 6)).await.unwrap();
        let sample = read_frame_within(&mut line, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!((sample.pm1_0, sample.pm2_5, sample.pm10), (4, 5, 6));
    }

    #[tokio::test]
    async fn test_returns_first_successful_sample() {
        let expected = Sample::new(1, 2, 3);
        let source = ScriptedSource::failing_then(3, expected);
        let attempts = source.attempts.clone();
        let sink = RecordingSink::new(attempts.clone());
        let mut reader = SensorReader::new(source, fast_policy());

        let sample = reader
            .read_sample(&sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sample, expected);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_escalates_exactly_once_after_threshold() {
        let expected = Sample::new(7, 8, 9);
        let source = ScriptedSource::failing_then(150, expected);
        let attempts = source.attempts.clone();
        let sink = RecordingSink::new(attempts.clone());
        let mut reader = SensorReader::new(source, fast_policy());

        let sample = reader
            .read_sample(&sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sample, expected);
        assert_eq!(attempts.load(Ordering::SeqCst), 151);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let (event, at_attempt) = &events[0];
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(event.code, LogCode::SensorPm25ReadFail);
        assert_eq!(*at_attempt, 101);
    }

    #[tokio::test]
    async fn test_exactly_threshold_failures_do_not_escalate() {
        let source = ScriptedSource::failing_then(100, Sample::new(1, 1, 1));
        let sink = RecordingSink::new(source.attempts.clone());
        let mut reader = SensorReader::new(source, fast_policy());

        reader
            .read_sample(&sink, &CancellationToken::new())
            .await
            .unwrap();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_resets_per_call() {
        let policy = RetryPolicy {
            delay: Duration::ZERO,
            escalation_threshold: 2,
        };
        let mut source = ScriptedSource::failing_then(4, Sample::new(1, 1, 1));
        for i in 0..4 {
            source
                .script
                .push_back(Err(TransportError::Transient(format!("again {}", i))));
        }
        source.script.push_back(Ok(Sample::new(2, 2, 2)));
        let sink = RecordingSink::new(source.attempts.clone());
        let mut reader = SensorReader::new(source, policy);
        let cancel = CancellationToken::new();

        reader.read_sample(&sink, &cancel).await.unwrap();
        reader.read_sample(&sink, &cancel).await.unwrap();

        let at: Vec<usize> = sink.events().iter().map(|(_, n)| *n).collect();
        assert_eq!(at, vec![3, 8]);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_retrying() {
        let source = ScriptedSource::new(vec![
            Err(TransportError::Transient("timeout".to_string())),
            Err(TransportError::Fatal("gone".to_string())),
            Ok(Sample::new(1, 1, 1)),
        ]);
        let attempts = source.attempts.clone();
        let sink = RecordingSink::new(attempts.clone());
        let mut reader = SensorReader::new(source, fast_policy());

        let err = reader
            .read_sample(&sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SensorError::Transport(TransportError::Fatal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_endless_failures() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(Vec::new()).cancel_on(120, cancel.clone());
        let attempts = source.attempts.clone();
        let sink = RecordingSink::new(attempts.clone());
        let mut reader = SensorReader::new(source, fast_policy());

        let err = reader.read_sample(&sink, &cancel).await.unwrap_err();
        assert!(matches!(err, SensorError::Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 120);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_fixed_delay_before_each_attempt() {
        let source = ScriptedSource::failing_then(2, Sample::new(1, 1, 1));
        let sink = RecordingSink::new(source.attempts.clone());
        let mut reader = SensorReader::new(source, RetryPolicy::default());

        let started = tokio::time::Instant::now();
        reader
            .read_sample(&sink, &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3_100));
    }
}
