// file: src/flash/mod.rs
// version: 1.5.0
// guid: 4b5c6d7e-8f90-1234-5678-90abcdef0123

//! Image acquisition and device flashing.
//!
//! A flash run walks the fixed stage order: download, verify, extract,
//! unmount, write, configure, eject. Stage failures are terminal; a retried
//! run starts again at download, where the image cache makes the repeat
//! cheap. At most one run per device is allowed at a time; a duplicate start
//! for a busy device is a silent no-op so the device only ever sees one
//! terminal outcome.

use crate::config::{BootConfig, ProvisioningConfig};
use crate::device::{self, StorageDevice};
use crate::progress::{
    EmitGate, FlashStage, InstallationOutcome, ProgressSender, StageId, StageRecord,
};
use crate::{ProvisionError, Result};
use chrono::Utc;
use futures::StreamExt;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const RASPIOS_INDEX: &str = "https://downloads.raspberrypi.com/raspios_lite_arm64/images/";

const WRITE_CHUNK: usize = 4 * 1024 * 1024;
/// How long to wait for the host to re-mount the boot partition after the
/// raw write completes.
const BOOT_MOUNT_WAIT: Duration = Duration::from_secs(30);

/// Inputs for one flash run.
#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub device: StorageDevice,
    pub config: ProvisioningConfig,
    /// Injected into the image's authorized_keys at first boot.
    pub public_key: String,
    /// Explicit image URL; when absent the latest lite arm64 release is
    /// resolved from the public download index.
    pub image_url: Option<String>,
}

/// Orchestrates flash runs and holds the per-device concurrency latch.
pub struct FlashEngine {
    client: reqwest::Client,
    cache_dir: PathBuf,
    active: Mutex<HashSet<String>>,
}

impl FlashEngine {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_dir,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Run a full flash against the requested device.
    ///
    /// Returns `None` when a run is already in flight for the same device
    /// path; that earlier run produces the device's single terminal outcome.
    pub async fn run(
        &self,
        request: FlashRequest,
        progress: ProgressSender,
    ) -> Result<Option<InstallationOutcome>> {
        let guard = match self.begin(&request.device.path) {
            Some(guard) => guard,
            None => {
                debug!("Flash already in progress for {}", request.device.path);
                return Ok(None);
            }
        };

        let mut ctx = FlashContext::default();
        let mut stage_log = Vec::new();

        for stage in FlashStage::ALL {
            progress.emit(
                StageId::Flash(stage),
                stage.window().0,
                format!("Starting {}", stage.as_str()),
            );

            let started_at = Utc::now();
            let t0 = Instant::now();
            let result = self.run_stage(stage, &request, &mut ctx, &progress).await;

            stage_log.push(StageRecord {
                stage: stage.as_str().to_string(),
                started_at,
                duration_ms: t0.elapsed().as_millis() as i64,
                success: result.is_ok(),
            });

            if let Err(e) = result {
                progress.emit(
                    StageId::Flash(stage),
                    stage.window().0,
                    format!("{} failed: {}", stage.as_str(), e),
                );
                drop(guard);
                return Ok(Some(InstallationOutcome::failure(
                    stage.as_str(),
                    e.to_string(),
                    stage_log,
                )));
            }
        }

        progress.emit(StageId::Flash(FlashStage::Eject), 100, "Flash complete");
        drop(guard);
        Ok(Some(InstallationOutcome::success(
            BTreeMap::new(),
            stage_log,
        )))
    }

    fn begin(&self, device_path: &str) -> Option<ActiveGuard<'_>> {
        let mut active = self.active.lock().expect("flash latch lock");
        if !active.insert(device_path.to_string()) {
            return None;
        }
        Some(ActiveGuard {
            engine: self,
            key: device_path.to_string(),
        })
    }

    async fn run_stage(
        &self,
        stage: FlashStage,
        request: &FlashRequest,
        ctx: &mut FlashContext,
        progress: &ProgressSender,
    ) -> Result<()> {
        match stage {
            FlashStage::Download => {
                let url = match &request.image_url {
                    Some(raw) => url::Url::parse(raw)
                        .map_err(|e| {
                            ProvisionError::Validation(format!("invalid image URL: {}", e))
                        })?
                        .to_string(),
                    None => self.resolve_image_url().await?,
                };
                ctx.archive_path = Some(self.download_cached(&url, progress).await?);
                ctx.image_url = Some(url);
                Ok(())
            }
            FlashStage::Verify => {
                let url = ctx.image_url.as_deref().expect("download ran first");
                let path = ctx.archive_path.as_deref().expect("download ran first");
                self.verify_checksum(url, path, progress).await
            }
            FlashStage::Extract => {
                let path = ctx.archive_path.as_deref().expect("download ran first");
                ctx.image_path = Some(extract_image(path, progress).await?);
                Ok(())
            }
            FlashStage::Unmount => device::unmount_device(&request.device.path).await,
            FlashStage::Write => {
                device::verify_safe_to_flash(&request.device.path, request.device.size)?;
                let image = ctx.image_path.as_deref().expect("extract ran first");
                write_image(image, &request.device.path, progress).await
            }
            FlashStage::Configure => {
                configure_boot_partition(&request.config, &request.public_key, progress).await
            }
            FlashStage::Eject => device::eject_device(&request.device.path).await,
        }
    }

    /// Resolve the newest lite arm64 release from the download index.
    async fn resolve_image_url(&self) -> Result<String> {
        let index = self.client.get(RASPIOS_INDEX).send().await?.text().await?;
        let release_re = Regex::new(r#"href="(raspios_lite_arm64-[0-9-]+)/""#)
            .map_err(|e| ProvisionError::config(e.to_string()))?;
        let release = release_re
            .captures_iter(&index)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .max()
            .ok_or_else(|| {
                ProvisionError::network("no releases found in the image index".to_string())
            })?;

        let dir_url = format!("{}{}/", RASPIOS_INDEX, release);
        let listing = self.client.get(&dir_url).send().await?.text().await?;
        let image_re = Regex::new(r#"href="([^"]+\.img\.xz)""#)
            .map_err(|e| ProvisionError::config(e.to_string()))?;
        let image = image_re
            .captures_iter(&listing)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .max()
            .ok_or_else(|| {
                ProvisionError::network(format!("no image archive found under {}", dir_url))
            })?;

        let url = format!("{}{}", dir_url, image);
        info!("Resolved latest image: {}", url);
        Ok(url)
    }

    /// Download into the cache, skipping when the archive is already there.
    async fn download_cached(&self, url: &str, progress: &ProgressSender) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let dest = self.cache_dir.join(cache_file_name(url));

        if tokio::fs::try_exists(&dest).await? {
            info!("Using cached image {}", dest.display());
            progress.emit(
                StageId::Flash(FlashStage::Download),
                FlashStage::Download.window().1,
                "Using cached image",
            );
            return Ok(dest);
        }

        info!("Downloading {}", url);
        let response = self.client.get(url).send().await?.error_for_status()?;
        let total = response.content_length().unwrap_or(0);

        let partial = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        let started = Instant::now();
        let gate = EmitGate::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if gate.ready() {
                progress.emit_throughput(
                    StageId::Flash(FlashStage::Download),
                    download_percent(total, written),
                    download_message(total, written),
                    format_rate(written, started.elapsed()),
                );
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, &dest).await?;
        Ok(dest)
    }

    /// Fetch the published digest and compare it against the local archive.
    async fn verify_checksum(
        &self,
        url: &str,
        path: &Path,
        progress: &ProgressSender,
    ) -> Result<()> {
        let checksum_url = format!("{}.sha256", url);
        let body = self
            .client
            .get(&checksum_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let expected = body
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();
        if expected.len() != 64 {
            return Err(ProvisionError::network(format!(
                "malformed digest at {}",
                checksum_url
            )));
        }

        progress.emit(
            StageId::Flash(FlashStage::Verify),
            FlashStage::Verify.window().0,
            "Verifying image digest",
        );

        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        let actual = hex::encode(hasher.finalize());

        if actual != expected {
            // A bad cache entry must not survive to the next attempt.
            let _ = tokio::fs::remove_file(path).await;
            return Err(ProvisionError::ChecksumMismatch { expected, actual });
        }

        debug!("Image digest verified ({})", actual);
        Ok(())
    }
}

/// Removes the device from the in-flight set when the run ends, on any path.
struct ActiveGuard<'a> {
    engine: &'a FlashEngine,
    key: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.engine.active.lock() {
            active.remove(&self.key);
        }
    }
}

#[derive(Default)]
struct FlashContext {
    image_url: Option<String>,
    archive_path: Option<PathBuf>,
    image_path: Option<PathBuf>,
}

/// Percentage within the download window. Servers that omit Content-Length
/// leave the bar at the window start; throughput still updates per chunk.
fn download_percent(total: u64, written: u64) -> u8 {
    if total > 0 {
        FlashStage::Download.percent_at(written as f64 / total as f64)
    } else {
        FlashStage::Download.window().0
    }
}

fn download_message(total: u64, written: u64) -> String {
    if total > 0 {
        format!("Downloading image ({} / {} MB)", written >> 20, total >> 20)
    } else {
        format!("Downloading image ({} MB)", written >> 20)
    }
}

fn cache_file_name(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("image.img.xz")
        .to_string()
}

/// Decompress an `.xz` archive next to itself, keeping the archive for
/// future runs. Already-raw images pass through untouched.
///
/// Decompression goes through a temporary file that is renamed into place
/// only on success, so a crash mid-extraction can never leave a truncated
/// image under the final name. A leftover image from an earlier run is not
/// trusted; only the verified archive is.
async fn extract_image(archive: &Path, progress: &ProgressSender) -> Result<PathBuf> {
    if archive.extension().and_then(|e| e.to_str()) != Some("xz") {
        return Ok(archive.to_path_buf());
    }

    let image = archive.with_extension("");
    let partial = image.with_extension("img.partial");

    let xz = which::which("xz")
        .map_err(|_| ProvisionError::config("xz is required to extract image archives"))?;

    progress.emit(
        StageId::Flash(FlashStage::Extract),
        FlashStage::Extract.window().0,
        "Extracting image archive",
    );

    let out = std::fs::File::create(&partial)?;
    let child = tokio::process::Command::new(xz)
        .arg("-dc")
        .arg(archive)
        .stdout(std::process::Stdio::from(out))
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(ProvisionError::config(format!(
            "extraction failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    tokio::fs::rename(&partial, &image).await?;
    debug!("Extracted {}", image.display());
    Ok(image)
}

/// Stream the raw image onto the device and flush it to stable storage.
async fn write_image(image: &Path, device_path: &str, progress: &ProgressSender) -> Result<()> {
    let total = tokio::fs::metadata(image).await?.len();
    let mut source = tokio::fs::File::open(image).await?;

    let mut target = tokio::fs::OpenOptions::new()
        .write(true)
        .open(device_path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => ProvisionError::PermissionDenied(format!(
                "cannot open {} for writing (elevated privileges required)",
                device_path
            )),
            _ => ProvisionError::WriteIo(format!("cannot open {}: {}", device_path, e)),
        })?;

    info!("Writing {} MB to {}", total >> 20, device_path);
    let mut buffer = vec![0u8; WRITE_CHUNK];
    let mut written = 0u64;
    let started = Instant::now();
    let gate = EmitGate::default();

    loop {
        let n = source.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        target
            .write_all(&buffer[..n])
            .await
            .map_err(|e| ProvisionError::WriteIo(format!("{}: {}", device_path, e)))?;
        written += n as u64;

        if gate.ready() {
            let fraction = written as f64 / total as f64;
            progress.emit_throughput(
                StageId::Flash(FlashStage::Write),
                FlashStage::Write.percent_at(fraction),
                format!("Writing image ({} / {} MB)", written >> 20, total >> 20),
                format_rate(written, started.elapsed()),
            );
        }
    }

    target
        .sync_all()
        .await
        .map_err(|e| ProvisionError::WriteIo(format!("sync of {} failed: {}", device_path, e)))?;
    info!("Write complete, {} bytes flushed", written);
    Ok(())
}

/// Drop the unattended first-boot configuration onto the freshly written
/// boot partition once the host re-mounts it.
async fn configure_boot_partition(
    config: &ProvisioningConfig,
    public_key: &str,
    progress: &ProgressSender,
) -> Result<()> {
    progress.emit(
        StageId::Flash(FlashStage::Configure),
        FlashStage::Configure.window().0,
        "Waiting for boot partition",
    );

    let boot = wait_for_boot_mount().await?;
    info!("Boot partition mounted at {}", boot.display());

    let boot_config = BootConfig::new(config, public_key);

    // Empty marker file enabling the SSH daemon on first boot.
    tokio::fs::write(boot.join("ssh"), b"").await?;
    tokio::fs::write(boot.join("custom.toml"), boot_config.to_toml()?).await?;
    tokio::fs::write(boot.join("userconf.txt"), boot_config.to_userconf()).await?;

    Ok(())
}

/// Poll for the boot partition the host automounter brings back after the
/// raw write. Partition labels follow the image convention (boot / bootfs).
async fn wait_for_boot_mount() -> Result<PathBuf> {
    let deadline = Instant::now() + BOOT_MOUNT_WAIT;
    loop {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        for disk in disks.list() {
            let mount = disk.mount_point().to_path_buf();
            if let Some(name) = mount.file_name().and_then(|n| n.to_str()) {
                if name.eq_ignore_ascii_case("boot") || name.eq_ignore_ascii_case("bootfs") {
                    return Ok(mount);
                }
            }
        }

        if Instant::now() >= deadline {
            return Err(ProvisionError::WriteIo(
                "boot partition did not re-mount after writing".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn format_rate(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64().max(0.001);
    format!("{:.1} MB/s", bytes as f64 / secs / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_file_name_from_url() {
        assert_eq!(
            cache_file_name("https://host/images/r-2024/2024-07-04-raspios.img.xz"),
            "2024-07-04-raspios.img.xz"
        );
        assert_eq!(cache_file_name("https://host/"), "image.img.xz");
    }

    #[test]
    fn test_format_rate() {
        let rate = format_rate(10 * 1024 * 1024, Duration::from_secs(2));
        assert_eq!(rate, "5.0 MB/s");
    }

    #[test]
    fn test_duplicate_device_is_latched() {
        let engine = FlashEngine::new(std::env::temp_dir());
        let first = engine.begin("/dev/sdx");
        assert!(first.is_some());
        assert!(engine.begin("/dev/sdx").is_none());
        // A different device is unaffected.
        assert!(engine.begin("/dev/sdy").is_some());
        drop(first);
        assert!(engine.begin("/dev/sdx").is_some());
    }

    #[test]
    fn test_release_listing_parses_newest_entry() {
        let listing = r#"
            <a href="raspios_lite_arm64-2024-03-15/">raspios_lite_arm64-2024-03-15/</a>
            <a href="raspios_lite_arm64-2024-07-04/">raspios_lite_arm64-2024-07-04/</a>
        "#;
        let re = Regex::new(r#"href="(raspios_lite_arm64-[0-9-]+)/""#).unwrap();
        let newest = re
            .captures_iter(listing)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .max()
            .unwrap();
        assert_eq!(newest, "raspios_lite_arm64-2024-07-04");
    }

    #[test]
    fn test_download_percent_with_unknown_length_stays_in_window() {
        // No Content-Length: the bar holds at the window start but events
        // still flow with throughput.
        assert_eq!(download_percent(0, 5 << 20), FlashStage::Download.window().0);
        assert_eq!(download_percent(100, 50), FlashStage::Download.percent_at(0.5));
        assert!(download_message(0, 5 << 20).contains("5 MB"));
        assert!(!download_message(0, 5 << 20).contains('/'));
        assert!(download_message(10 << 20, 5 << 20).contains("5 / 10 MB"));
    }

    #[tokio::test]
    async fn test_stale_image_from_interrupted_extraction_is_replaced() {
        if which::which("xz").is_err() {
            return;
        }
        let (tx, _rx) = crate::progress::channel();
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("os.img");
        let archive = dir.path().join("os.img.xz");

        tokio::fs::write(&image, b"full image contents").await.unwrap();
        let status = tokio::process::Command::new("xz")
            .arg("-zkf")
            .arg(&image)
            .status()
            .await
            .unwrap();
        assert!(status.success());

        // Simulate a crash partway through an earlier extraction.
        tokio::fs::write(&image, b"TRUNC").await.unwrap();

        let out = extract_image(&archive, &tx).await.unwrap();
        let contents = tokio::fs::read(&out).await.unwrap();
        assert_eq!(contents, b"full image contents");
    }

    #[tokio::test]
    async fn test_failed_extraction_leaves_no_image_behind() {
        if which::which("xz").is_err() {
            return;
        }
        let (tx, _rx) = crate::progress::channel();
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("os.img.xz");
        tokio::fs::write(&archive, b"not xz data").await.unwrap();

        assert!(extract_image(&archive, &tx).await.is_err());
        assert!(!dir.path().join("os.img").exists());
        assert!(!dir.path().join("os.img.partial").exists());
    }

    #[tokio::test]
    async fn test_extract_passes_raw_images_through() {
        let (tx, _rx) = crate::progress::channel();
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("disk.img");
        tokio::fs::write(&raw, b"raw").await.unwrap();
        let out = extract_image(&raw, &tx).await.unwrap();
        assert_eq!(out, raw);
    }
}
