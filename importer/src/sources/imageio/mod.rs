//! oVirt imageio downloads.
//!
//! An image transfer is opened on the engine and the raw disk is streamed
//! from the transfer URL straight into the destination. The transfer ticket
//! is finalized (or cancelled) exactly once, when the copy ends or the
//! source closes.

mod client;

use std::path::Path;
use std::thread;
use std::time::Duration;

use importer_shared::constants::transfer::{IDLE_TIMEOUT_SECS, POLL_INTERVAL_MS};
use importer_shared::{ImportError, ImportResult};
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use client::{
    Disk, DiskFormat, DiskSnapshot, ImageTransfer, OvirtClient, OvirtConnector, RestOvirtClient,
    RestOvirtConnector, TransferPhase, TransferRequest,
};

use super::http::{HttpClient, TlsOptions, content_length, expect_ok, watch_idle};
use super::{Adapters, DataSource};
use crate::options::ImporterOptions;
use crate::phase::ProcessingPhase;
use crate::progress::{ProgressCounter, ProgressReader, ProgressTicker, ReadCount, start_ticker};
use crate::readers::BoxedReader;
use crate::sink::{is_block_device, stream_data_to_file};
use crate::util::clean_all;

/// Seconds of inactivity after which the engine drops the ticket.
const INACTIVITY_TIMEOUT_SECS: u64 = 60;
const CLEANUP_RETRIES: usize = 10;
const CLEANUP_DELAY: Duration = Duration::from_secs(2);
const INITIALIZING_POLL: Duration = Duration::from_secs(1);
const EXTENTS_FEATURE: &str = "extents";

/// Body of an `OPTIONS` request to the transfer URL.
#[derive(Debug, Default, Deserialize)]
struct ImageOptions {
    #[serde(default)]
    features: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Extent {
    length: u64,
    #[serde(default)]
    zero: bool,
}

/// Timing of the transfer ticket cleanup.
#[derive(Clone, Copy, Debug)]
pub struct CleanupPolicy {
    pub retries: usize,
    pub delay: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            retries: CLEANUP_RETRIES,
            delay: CLEANUP_DELAY,
        }
    }
}

/// Disk downloaded through an oVirt image transfer.
///
/// Phases: Info → TransferDataFile → Resize.
pub struct ImageioSource {
    reader: Option<BoxedReader>,
    count: ReadCount,
    total: u64,
    counter: Option<ProgressCounter>,
    ticker: Option<ProgressTicker>,
    preallocation: bool,
    connection: Option<Box<dyn OvirtClient>>,
    transfer_id: Option<String>,
    cleanup: CleanupPolicy,
    cleanup_done: bool,
    token: CancellationToken,
    _http: HttpClient,
}

impl ImageioSource {
    pub fn new(options: &ImporterOptions, adapters: &Adapters) -> ImportResult<Self> {
        Self::with_cleanup(options, adapters, CleanupPolicy::default())
    }

    pub fn with_cleanup(
        options: &ImporterOptions,
        adapters: &Adapters,
        cleanup: CleanupPolicy,
    ) -> ImportResult<Self> {
        let tls = TlsOptions {
            cert_dir: options.cert_dir.clone(),
            proxy_cert_dir: None,
            insecure: options.insecure_tls,
        };
        let connection = adapters
            .ovirt
            .connect(&options.endpoint, &options.access_key, &options.secret_key, &tls)
            .map_err(|e| e.context("Error creating connection"))?;

        let mut transfer_id = None;
        match open_transfer(connection.as_ref(), options, &tls, &mut transfer_id) {
            Ok((http, body, total, token)) => {
                let counted = ProgressReader::new(body, total, None);
                let count = counted.count();
                http.spawn(watch_idle(
                    count.clone(),
                    Duration::from_secs(IDLE_TIMEOUT_SECS),
                    Duration::from_millis(POLL_INTERVAL_MS),
                    token.clone(),
                ));
                Ok(Self {
                    reader: Some(Box::new(counted)),
                    count,
                    total,
                    counter: adapters.counter(&options.owner_uid),
                    ticker: None,
                    preallocation: options.preallocation,
                    connection: Some(connection),
                    transfer_id,
                    cleanup,
                    cleanup_done: false,
                    token,
                    _http: http,
                })
            }
            Err(e) => {
                if let Some(id) = &transfer_id
                    && let Err(cleanup_err) = cleanup_transfer(connection.as_ref(), id, cleanup)
                {
                    tracing::error!(
                        "Failed to close image transfer after failure creating data source: {}",
                        cleanup_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Finalize or cancel the transfer ticket, once.
    fn cleanup_transfer(&mut self) {
        if self.cleanup_done {
            return;
        }
        let (Some(connection), Some(id)) = (self.connection.as_deref(), self.transfer_id.as_deref())
        else {
            tracing::info!("No transfer to clean up.");
            self.cleanup_done = true;
            return;
        };
        match cleanup_transfer(connection, id, self.cleanup) {
            Ok(()) => self.cleanup_done = true,
            Err(e) => tracing::error!("Failed to clean up image transfer: {}", e),
        }
    }
}

/// Locate the disk (and snapshot), start a download and open its stream.
/// The transfer ID is stored in `transfer_id` as soon as it exists so the
/// caller can clean it up on failure.
fn open_transfer(
    connection: &dyn OvirtClient,
    options: &ImporterOptions,
    tls: &TlsOptions,
    transfer_id: &mut Option<String>,
) -> ImportResult<(HttpClient, BoxedReader, u64, CancellationToken)> {
    let disk_id = options.disk_id.as_str();
    let disk = connection.disk(disk_id)?;
    match disk.id.as_deref() {
        None => tracing::warn!("Unable to get ID from disk object, setting it from given {}.", disk_id),
        Some(id) if id != disk_id => {
            tracing::warn!("Retrieved disk ID {} does not match expected disk ID {}!", id, disk_id)
        }
        Some(_) => {}
    }

    let checkpoint = options.vddk.current_checkpoint.as_str();
    let mut snapshot = None;
    if !checkpoint.is_empty() {
        match find_snapshot(connection, &disk, disk_id, checkpoint) {
            Ok(found) => snapshot = Some(found),
            Err(e) => {
                if disk.image_id.as_deref() != Some(checkpoint) {
                    return Err(ImportError::SnapshotNotFound(format!(
                        "snapshot {} not found: {}",
                        checkpoint, e
                    )));
                }
                tracing::info!(
                    "Snapshot ID {} found on disk {}, transferring active disk as checkpoint",
                    checkpoint,
                    disk_id
                );
            }
        }
    }

    let mut total = disk
        .total_size
        .ok_or_else(|| ImportError::Internal("Error total disk size not available".into()))?;
    let request = TransferRequest {
        disk_id: disk_id.to_string(),
        snapshot_id: snapshot.as_ref().and_then(|s: &DiskSnapshot| s.id.clone()),
        format: DiskFormat::Raw,
        inactivity_timeout: INACTIVITY_TIMEOUT_SECS,
    };
    let transfer = start_transfer(connection, &request, transfer_id)?;
    let transfer_url = transfer
        .transfer_url
        .ok_or_else(|| ImportError::Network("Error transfer url not available".into()))?;
    let transfer_url = Url::parse(&transfer_url)
        .map_err(|e| ImportError::Network(format!("invalid transfer url: {}", e)))?;

    let http = HttpClient::new(tls)?;
    match extents_total(&http, &transfer_url) {
        Ok(Some(size)) => total = size,
        Ok(None) => {}
        Err(e) => tracing::info!("Unable to check extents feature on this endpoint: {}", e),
    }

    let resp = http
        .send(Method::GET, &transfer_url, None, &HeaderMap::new())
        .and_then(expect_ok)
        .map_err(|e| e.context("Sending request failed"))?;
    if total == 0 {
        total = content_length(resp.headers());
    }
    let token = CancellationToken::new();
    let body = http.stream(resp, token.clone());
    Ok((http, Box::new(body), total, token))
}

/// Snapshot `snapshot_id` of `disk`, searched across its storage domains.
fn find_snapshot(
    connection: &dyn OvirtClient,
    disk: &Disk,
    disk_id: &str,
    snapshot_id: &str,
) -> ImportResult<DiskSnapshot> {
    let domains = disk
        .storage_domains
        .as_ref()
        .map(|d| d.storage_domain.as_slice())
        .unwrap_or_default();
    if domains.is_empty() {
        return Err(ImportError::SnapshotNotFound(format!(
            "no storage domains listed for disk {}",
            disk_id
        )));
    }
    for domain in domains {
        let snapshots = connection.disk_snapshots(&domain.id)?;
        if snapshots.is_empty() {
            return Err(ImportError::SnapshotNotFound(format!(
                "no snapshots listed in storage domain {}",
                domain.id
            )));
        }
        if let Some(found) = snapshots
            .into_iter()
            .find(|s| s.id.as_deref() == Some(snapshot_id))
        {
            tracing::info!(
                "Successfully located snapshot {} on disk {}, in storage domain {}",
                snapshot_id,
                disk_id,
                domain.id
            );
            return Ok(found);
        }
    }
    Err(ImportError::SnapshotNotFound(format!(
        "could not find snapshot {} on disk {}",
        snapshot_id, disk_id
    )))
}

/// Create the transfer and wait until it is `transferring`.
fn start_transfer(
    connection: &dyn OvirtClient,
    request: &TransferRequest,
    transfer_id: &mut Option<String>,
) -> ImportResult<ImageTransfer> {
    let mut transfer = connection.add_transfer(request)?;
    *transfer_id = transfer.id.clone();
    let id = transfer
        .id
        .clone()
        .ok_or_else(|| ImportError::Network("Error image transfer not available".into()))?;
    loop {
        match &transfer.phase {
            Some(TransferPhase::Transferring) => return Ok(transfer),
            Some(TransferPhase::Initializing) => {
                thread::sleep(INITIALIZING_POLL);
                transfer = connection.transfer(&id)?;
            }
            Some(other) => {
                return Err(ImportError::Network(format!("Error transfer phase: {:?}", other)));
            }
            None => return Err(ImportError::Network("Error phase not available".into())),
        }
    }
}

/// Size of the disk from its extents, when the daemon offers them.
fn extents_total(http: &HttpClient, transfer_url: &Url) -> ImportResult<Option<u64>> {
    let resp = http.send(Method::OPTIONS, transfer_url, None, &HeaderMap::new())?;
    let options: ImageOptions = http
        .block_on(resp.json())
        .map_err(|e| ImportError::Network(format!("unable to decode options response: {}", e)))?;
    if !options.features.iter().any(|f| f == EXTENTS_FEATURE) {
        return Ok(None);
    }

    let extents_url = Url::parse(&format!("{}/extents", transfer_url.as_str().trim_end_matches('/')))
        .map_err(|e| ImportError::Internal(format!("invalid extents url: {}", e)))?;
    let extents: Vec<Extent> = http
        .get_json(&extents_url)
        .map_err(|e| e.context("failed to query extents"))?;
    let total: u64 = extents.iter().map(|e| e.length).sum();
    let nonzero: u64 = extents.iter().filter(|e| !e.zero).map(|e| e.length).sum();
    tracing::info!(
        "Total size of non-zero extents: {}, total size of all extents: {}",
        nonzero,
        total
    );
    Ok(Some(total))
}

/// What cleanup does for a transfer in `phase`.
#[derive(Debug, PartialEq, Eq)]
enum CleanupAction {
    Nothing,
    Cancel,
    Finalize,
}

fn cleanup_action(phase: &TransferPhase) -> Option<CleanupAction> {
    match phase {
        TransferPhase::Cancelled
        | TransferPhase::CancelledSystem
        | TransferPhase::CancelledUser
        | TransferPhase::FinalizingCleanup
        | TransferPhase::FinalizingFailure
        | TransferPhase::FinalizingSuccess
        | TransferPhase::FinishedFailure
        | TransferPhase::FinishedSuccess => Some(CleanupAction::Nothing),
        TransferPhase::Initializing
        | TransferPhase::PausedSystem
        | TransferPhase::PausedUser
        | TransferPhase::Resuming
        | TransferPhase::Unknown => Some(CleanupAction::Cancel),
        TransferPhase::Transferring => Some(CleanupAction::Finalize),
        TransferPhase::Other(_) => None,
    }
}

/// Drive transfer `id` to a finished state: finalize while transferring,
/// cancel anything stuck, retry on failure.
fn cleanup_transfer(connection: &dyn OvirtClient, id: &str, policy: CleanupPolicy) -> ImportResult<()> {
    tracing::info!("Closing image transfer {}.", id);
    let cancel = || {
        tracing::info!("Cancelling image transfer.");
        if let Err(e) = connection.cancel_transfer(id) {
            tracing::warn!("Unable to cancel image transfer; {}", e);
        }
    };

    let mut last_err = None;
    for remaining in (1..=policy.retries).rev() {
        let phase = match connection.transfer(id) {
            Ok(transfer) => transfer.phase,
            Err(e) if matches!(e.root(), ImportError::UnexpectedStatus { status: 404, .. }) => {
                tracing::info!("Transfer ticket cleaned up.");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("Unable to read image transfer response, {} retries remaining.", remaining);
                last_err = Some(e);
                cancel();
                thread::sleep(policy.delay);
                continue;
            }
        };
        let Some(phase) = phase else {
            tracing::warn!("Unable to get transfer phase, {} retries remaining.", remaining);
            cancel();
            thread::sleep(policy.delay);
            continue;
        };

        tracing::info!("Current image transfer phase is: {:?}", phase);
        let result = match cleanup_action(&phase) {
            Some(CleanupAction::Nothing) => {
                tracing::info!("No cleanup action required for this image transfer phase, done.");
                return Ok(());
            }
            Some(CleanupAction::Cancel) => {
                tracing::info!("Cancelling image transfer.");
                connection.cancel_transfer(id)
            }
            Some(CleanupAction::Finalize) => {
                tracing::info!("Finalizing image transfer.");
                connection.finalize_transfer(id)
            }
            None => {
                tracing::warn!("Unknown transfer phase '{:?}', {} retries remaining.", phase, remaining);
                cancel();
                thread::sleep(policy.delay);
                continue;
            }
        };
        if let Err(e) = result {
            tracing::warn!("Failed to run transfer cleanup command, {} retries remaining.", remaining);
            last_err = Some(e);
            thread::sleep(policy.delay);
        }
    }

    let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
    Err(ImportError::Network(format!(
        "retry limit exceeded for transfer ticket cleanup, disk may remain locked until inactivity timeout: {}",
        reason
    )))
}

impl DataSource for ImageioSource {
    fn info(&mut self) -> ImportResult<ProcessingPhase> {
        if self.reader.is_none() {
            return Err(ImportError::Internal("imageio stream already consumed".into()));
        }
        Ok(ProcessingPhase::TransferDataFile)
    }

    fn transfer(&mut self, _path: &Path) -> ImportResult<ProcessingPhase> {
        Err(ImportError::Internal(
            "imageio downloads are written straight to the data file".into(),
        ))
    }

    fn transfer_file(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        if !is_block_device(path) {
            clean_all(path)?;
        }
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| ImportError::Internal("imageio stream already consumed".into()))?;
        if let Some(counter) = self.counter.clone() {
            self.ticker = start_ticker(self.count.clone(), self.total, counter);
        }

        let result = stream_data_to_file(&mut reader, path, self.preallocation);
        self.ticker = None;
        drop(reader);
        self.cleanup_transfer();
        let (read, written) = result?;
        tracing::info!(read, written, "Wrote disk to {}", path.display());
        if let Some(counter) = &self.counter
            && self.total > 0
        {
            counter.advance_to(100.0);
        }
        Ok(ProcessingPhase::Resize)
    }

    fn url(&self) -> Option<String> {
        None
    }

    fn close(&mut self) -> ImportResult<()> {
        self.ticker = None;
        self.reader = None;
        self.cleanup_transfer();
        self.token.cancel();
        match self.connection.as_mut() {
            Some(connection) => connection.close(),
            None => Ok(()),
        }
    }
}
