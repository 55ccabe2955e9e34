// file: src/progress/mod.rs
// version: 1.3.0
// guid: c3d4e5f6-0718-293a-4b5c-6d7e8f901234

//! Progress channel shared by the flash engine and the remote installer.
//!
//! One append-only event stream per run, single producer and single consumer.
//! Observers must subscribe before the run starts; late subscribers may miss
//! earlier events. Percentages are clamped so they never go backwards within
//! a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Ordered stages of a flash run.
///
/// Each stage owns a contiguous percentage window; the windows together cover
/// 0..=100 so stage transitions alone keep the bar moving forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashStage {
    Download,
    Verify,
    Extract,
    Unmount,
    Write,
    Configure,
    Eject,
}

impl FlashStage {
    pub const ALL: [FlashStage; 7] = [
        FlashStage::Download,
        FlashStage::Verify,
        FlashStage::Extract,
        FlashStage::Unmount,
        FlashStage::Write,
        FlashStage::Configure,
        FlashStage::Eject,
    ];

    /// Percentage window (start, end) owned by this stage.
    pub fn window(&self) -> (u8, u8) {
        match self {
            FlashStage::Download => (0, 25),
            FlashStage::Verify => (25, 28),
            FlashStage::Extract => (28, 33),
            FlashStage::Unmount => (33, 35),
            FlashStage::Write => (35, 88),
            FlashStage::Configure => (88, 95),
            FlashStage::Eject => (95, 100),
        }
    }

    /// Map a within-stage fraction (0.0..=1.0) onto the run percentage.
    pub fn percent_at(&self, fraction: f64) -> u8 {
        let (start, end) = self.window();
        let span = (end - start) as f64;
        (start as f64 + span * fraction.clamp(0.0, 1.0)).round() as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlashStage::Download => "download",
            FlashStage::Verify => "verify",
            FlashStage::Extract => "extract",
            FlashStage::Unmount => "unmount",
            FlashStage::Write => "write",
            FlashStage::Configure => "configure",
            FlashStage::Eject => "eject",
        }
    }
}

/// Ordered stages of a remote install run.
///
/// Percentage is derived from stage position, not bytes or time, since most
/// stages are not byte-streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStage {
    Connect,
    SystemUpdate,
    ContainerRuntime,
    Reboot,
    FilesystemSetup,
    ServiceDeploy,
    ServiceStart,
    ServiceReadiness,
    ServiceConfiguration,
    Finalize,
}

impl InstallStage {
    pub const ALL: [InstallStage; 10] = [
        InstallStage::Connect,
        InstallStage::SystemUpdate,
        InstallStage::ContainerRuntime,
        InstallStage::Reboot,
        InstallStage::FilesystemSetup,
        InstallStage::ServiceDeploy,
        InstallStage::ServiceStart,
        InstallStage::ServiceReadiness,
        InstallStage::ServiceConfiguration,
        InstallStage::Finalize,
    ];

    /// Zero-based position in the fixed stage order.
    pub fn position(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).expect("stage in ALL")
    }

    /// Run percentage at the start of this stage. The run reaches 100 only
    /// through the terminal success event.
    pub fn percent(&self) -> u8 {
        (self.position() * 96 / (Self::ALL.len() - 1)) as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStage::Connect => "connect",
            InstallStage::SystemUpdate => "system-update",
            InstallStage::ContainerRuntime => "container-runtime-install",
            InstallStage::Reboot => "reboot",
            InstallStage::FilesystemSetup => "filesystem-structure-setup",
            InstallStage::ServiceDeploy => "service-definition-deploy",
            InstallStage::ServiceStart => "service-start",
            InstallStage::ServiceReadiness => "service-readiness-wait",
            InstallStage::ServiceConfiguration => "per-service-configuration",
            InstallStage::Finalize => "finalize",
        }
    }
}

/// Stage identifier carried on every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageId {
    Flash(FlashStage),
    Install(InstallStage),
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Flash(s) => s.as_str(),
            StageId::Install(s) => s.as_str(),
        }
    }
}

/// A single progress event on the run's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: StageId,
    pub percent: u8,
    pub message: String,
    /// Human-readable throughput figure, e.g. "12.4 MB/s".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput: Option<String>,
    /// Stage-specific payload, e.g. a remotely issued auth token. Emitted
    /// once at the stage that produced it, never re-emitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Sending half of the progress channel.
///
/// Clamps percentages so they are monotonically non-decreasing for the life
/// of the run. Dropped receivers are tolerated; emission then becomes a no-op.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    last_percent: Arc<AtomicU8>,
}

impl ProgressSender {
    pub fn emit(&self, stage: StageId, percent: u8, message: impl Into<String>) {
        self.emit_full(stage, percent, message, None, None);
    }

    pub fn emit_throughput(
        &self,
        stage: StageId,
        percent: u8,
        message: impl Into<String>,
        throughput: impl Into<String>,
    ) {
        self.emit_full(stage, percent, message, Some(throughput.into()), None);
    }

    pub fn emit_full(
        &self,
        stage: StageId,
        percent: u8,
        message: impl Into<String>,
        throughput: Option<String>,
        payload: Option<serde_json::Value>,
    ) {
        let clamped = self.clamp(percent);
        let _ = self.tx.send(ProgressEvent {
            stage,
            percent: clamped,
            message: message.into(),
            throughput,
            payload,
        });
    }

    fn clamp(&self, percent: u8) -> u8 {
        let percent = percent.min(100);
        let mut prev = self.last_percent.load(Ordering::Relaxed);
        loop {
            if percent <= prev {
                return prev;
            }
            match self.last_percent.compare_exchange_weak(
                prev,
                percent,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return percent,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Highest percentage emitted so far on this run.
    pub fn high_water(&self) -> u8 {
        self.last_percent.load(Ordering::Relaxed)
    }
}

/// Create the progress channel for a single run.
pub fn channel() -> (ProgressSender, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressSender {
            tx,
            last_percent: Arc::new(AtomicU8::new(0)),
        },
        rx,
    )
}

/// Rate limiter for bursty emitters (download and raw-write loops), so the
/// consumer sees at most a few updates per second.
pub struct EmitGate {
    last: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl EmitGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            min_interval,
        }
    }

    /// True when enough time has passed since the last allowed emission.
    pub fn ready(&self) -> bool {
        let mut last = self.last.lock().expect("emit gate lock");
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl Default for EmitGate {
    fn default() -> Self {
        // A few updates per second at most
        Self::new(Duration::from_millis(300))
    }
}

/// Record of one completed (or failed) stage within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub success: bool,
}

/// Terminal artifact of a completed flash or install run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationOutcome {
    pub success: bool,
    /// Stage the run failed at, when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Remotely issued service credentials, keyed by the name the payload
    /// assigned them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, String>,
    #[serde(default)]
    pub stage_log: Vec<StageRecord>,
}

impl InstallationOutcome {
    pub fn success(credentials: BTreeMap<String, String>, stage_log: Vec<StageRecord>) -> Self {
        Self {
            success: true,
            failed_stage: None,
            message: None,
            credentials,
            stage_log,
        }
    }

    pub fn failure(
        stage: impl Into<String>,
        message: impl Into<String>,
        stage_log: Vec<StageRecord>,
    ) -> Self {
        Self {
            success: false,
            failed_stage: Some(stage.into()),
            message: Some(message.into()),
            credentials: BTreeMap::new(),
            stage_log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_windows_cover_the_run_in_order() {
        let mut cursor = 0u8;
        for stage in FlashStage::ALL {
            let (start, end) = stage.window();
            assert_eq!(start, cursor, "window gap before {:?}", stage);
            assert!(end > start);
            cursor = end;
        }
        assert_eq!(cursor, 100);
    }

    #[test]
    fn test_install_percent_is_monotonic_by_position() {
        let mut prev = None;
        for stage in InstallStage::ALL {
            let p = stage.percent();
            if let Some(prev) = prev {
                assert!(p > prev, "{:?} did not advance", stage);
            }
            prev = Some(p);
        }
        assert_eq!(InstallStage::Connect.percent(), 0);
        assert!(InstallStage::Finalize.percent() < 100);
    }

    #[tokio::test]
    async fn test_sender_never_reports_lower_percent() {
        let (tx, mut rx) = channel();
        tx.emit(StageId::Flash(FlashStage::Download), 10, "a");
        tx.emit(StageId::Flash(FlashStage::Download), 5, "b");
        tx.emit(StageId::Flash(FlashStage::Verify), 26, "c");

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(a.percent, 10);
        assert_eq!(b.percent, 10); // clamped, not regressed
        assert_eq!(c.percent, 26);
    }

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let (tx, mut rx) = channel();
        for i in 0..20u8 {
            tx.emit(StageId::Install(InstallStage::Connect), i, format!("{}", i));
        }
        let mut last = None;
        while let Ok(ev) = rx.try_recv() {
            if let Some(prev) = last {
                assert!(ev.message.parse::<u8>().unwrap() > prev);
            }
            last = Some(ev.message.parse::<u8>().unwrap());
        }
        assert_eq!(last, Some(19));
    }

    #[test]
    fn test_emit_gate_limits_rate() {
        let gate = EmitGate::new(Duration::from_millis(50));
        assert!(gate.ready());
        assert!(!gate.ready());
        std::thread::sleep(Duration::from_millis(60));
        assert!(gate.ready());
    }
}
