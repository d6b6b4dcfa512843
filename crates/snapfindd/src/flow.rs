//! Upload flow: Idle → Previewing → Processing → Idle.
//!
//! An upload becomes a pending [`UploadBatch`] held in memory (Previewing).
//! Only an explicit continue takes it out of the registry and processes it;
//! discarding drops it. Each item is captioned and saved independently, so one
//! bad file does not sink the rest of the batch.

use crate::engine::{EngineError, EngineHandle};
use snapfind_core::Device;
use snapfind_store::{FileStore, StoredImage};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// One uploaded file awaiting processing.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Files uploaded together, waiting for confirmation.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub id: Uuid,
    pub device: Device,
    pub items: Vec<PendingUpload>,
}

impl UploadBatch {
    pub fn new(device: Device, items: Vec<PendingUpload>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device,
            items,
        }
    }
}

/// Whether an uploaded filename has an accepted image extension.
pub fn is_accepted_upload(file_name: &str) -> bool {
    snapfind_store::has_image_extension(file_name)
}

/// Abandoned previews are dropped after this long.
pub const PENDING_TTL: Duration = Duration::from_secs(30 * 60);
/// Most batches held in Previewing at once; the oldest is evicted first.
pub const MAX_PENDING: usize = 16;

struct Pending {
    batch: UploadBatch,
    created: Instant,
}

/// Batches in the Previewing state, keyed by batch id.
///
/// Previews the user never confirms or discards are evicted on insert once
/// they exceed the TTL or the registry is full.
pub struct BatchRegistry {
    batches: Mutex<HashMap<Uuid, Pending>>,
    ttl: Duration,
    max_pending: usize,
}

impl Default for BatchRegistry {
    fn default() -> Self {
        Self::with_limits(PENDING_TTL, MAX_PENDING)
    }
}

impl BatchRegistry {
    pub fn with_limits(ttl: Duration, max_pending: usize) -> Self {
        Self {
            batches: Mutex::new(HashMap::new()),
            ttl,
            max_pending: max_pending.max(1),
        }
    }

    pub async fn insert(&self, batch: UploadBatch) {
        let mut batches = self.batches.lock().await;

        batches.retain(|id, pending| {
            let live = pending.created.elapsed() < self.ttl;
            if !live {
                tracing::info!(batch = %id, "pending batch expired");
            }
            live
        });
        while batches.len() >= self.max_pending {
            let oldest = batches
                .iter()
                .min_by_key(|(_, pending)| pending.created)
                .map(|(id, _)| *id);
            let Some(id) = oldest else { break };
            batches.remove(&id);
            tracing::info!(batch = %id, "pending batch evicted");
        }

        tracing::debug!(batch = %batch.id, files = batch.items.len(), "batch previewing");
        batches.insert(
            batch.id,
            Pending {
                batch,
                created: Instant::now(),
            },
        );
    }

    /// Bytes and name of one pending item, for the preview page.
    pub async fn item(&self, id: Uuid, index: usize) -> Option<PendingUpload> {
        self.batches
            .lock()
            .await
            .get(&id)
            .and_then(|p| p.batch.items.get(index).cloned())
    }

    /// Remove a batch, moving it out of Previewing.
    pub async fn take(&self, id: Uuid) -> Option<UploadBatch> {
        self.batches.lock().await.remove(&id).map(|p| p.batch)
    }

    pub async fn len(&self) -> usize {
        self.batches.lock().await.len()
    }
}

/// Result of processing one item.
#[derive(Debug)]
pub enum ItemOutcome {
    Saved {
        original: String,
        stored: StoredImage,
    },
    Failed {
        original: String,
        reason: String,
    },
}

/// Per-item results of a processed batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn saved(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Saved { .. }))
            .count()
    }

    /// `"{saved}/{total} images processed"`.
    pub fn progress_text(&self) -> String {
        format!("{}/{} images processed", self.saved(), self.total())
    }
}

/// Caption and save every item of `batch`.
///
/// Decode, caption, and write failures are recorded per item and the batch
/// continues. A model that cannot be loaded aborts the whole batch with
/// [`EngineError::ModelUnavailable`]; the batch is handed back so the caller
/// can keep it pending.
pub async fn process_batch(
    batch: UploadBatch,
    engine: &EngineHandle,
    store: &FileStore,
) -> Result<BatchReport, (UploadBatch, EngineError)> {
    let total = batch.items.len();
    let mut report = BatchReport::default();
    tracing::info!(batch = %batch.id, device = %batch.device, total, "processing batch");

    for i in 0..total {
        let original = batch.items[i].file_name.clone();
        let image = match decode(batch.items[i].bytes.clone()).await {
            Ok(image) => image,
            Err(reason) => {
                tracing::warn!(file = %original, %reason, "batch item: decode failed");
                report.outcomes.push(ItemOutcome::Failed { original, reason });
                continue;
            }
        };

        let caption = match engine.caption(image.clone(), batch.device).await {
            Ok(caption) => caption,
            Err(e @ EngineError::ModelUnavailable { .. }) => {
                tracing::error!(error = %e, "batch aborted");
                return Err((batch, e));
            }
            Err(e) => {
                tracing::warn!(file = %original, error = %e, "batch item: caption failed");
                report.outcomes.push(ItemOutcome::Failed {
                    original,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let writer = store.clone();
        let saved = tokio::task::spawn_blocking(move || writer.save(&image, &caption)).await;
        match saved {
            Ok(Ok(stored)) => report.outcomes.push(ItemOutcome::Saved { original, stored }),
            Ok(Err(e)) => {
                tracing::warn!(file = %original, error = %e, "batch item: store write failed");
                report.outcomes.push(ItemOutcome::Failed {
                    original,
                    reason: e.to_string(),
                });
            }
            Err(e) => report.outcomes.push(ItemOutcome::Failed {
                original,
                reason: format!("save task failed: {e}"),
            }),
        }
        tracing::info!(batch = %batch.id, done = i + 1, total, "batch progress");
    }

    tracing::info!(batch = %batch.id, progress = %report.progress_text(), "batch complete");
    Ok(report)
}

async fn decode(bytes: Vec<u8>) -> Result<image::DynamicImage, String> {
    match tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await {
        Ok(Ok(image)) => Ok(image),
        Ok(Err(e)) => Err(format!("not a readable image: {e}")),
        Err(e) => Err(format!("decode task failed: {e}")),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::tests::{failing_loader, fixed_loader};
    use std::collections::HashSet;
    use std::io::Cursor;

    pub(crate) fn png_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        image::DynamicImage::new_rgba8(6, 6)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn upload(name: &str, bytes: Vec<u8>) -> PendingUpload {
        PendingUpload {
            file_name: name.to_string(),
            bytes,
        }
    }

    #[test]
    fn test_accepted_extensions() {
        assert!(is_accepted_upload("a.jpg"));
        assert!(is_accepted_upload("b.JPEG"));
        assert!(is_accepted_upload("c.png"));
        assert!(!is_accepted_upload("d.gif"));
        assert!(!is_accepted_upload("png"));
    }

    #[tokio::test]
    async fn test_process_three_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let engine = spawn_engine(fixed_loader("a small cat"), None).unwrap();

        let batch = UploadBatch::new(
            Device::Cpu,
            (0..3).map(|i| upload(&format!("{i}.png"), png_bytes())).collect(),
        );
        let report = process_batch(batch, &engine, &store).await.unwrap();

        assert_eq!(report.progress_text(), "3/3 images processed");
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 3);
        let ids: HashSet<_> = listed.iter().filter_map(|i| i.id).collect();
        assert_eq!(ids.len(), 3);
        assert!(listed.iter().all(|i| i.file_name.ends_with("_a_small_cat.jpg")));
    }

    #[tokio::test]
    async fn test_bad_item_does_not_sink_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let engine = spawn_engine(fixed_loader("a tree"), None).unwrap();

        let batch = UploadBatch::new(
            Device::Cpu,
            vec![
                upload("good.png", png_bytes()),
                upload("broken.jpg", b"not an image".to_vec()),
                upload("also-good.png", png_bytes()),
            ],
        );
        let report = process_batch(batch, &engine, &store).await.unwrap();

        assert_eq!(report.total(), 3);
        assert_eq!(report.saved(), 2);
        assert!(matches!(
            &report.outcomes[1],
            ItemOutcome::Failed { original, .. } if original == "broken.jpg"
        ));
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_model_unavailable_returns_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let engine = spawn_engine(failing_loader(), None).unwrap();

        let batch = UploadBatch::new(Device::Cuda, vec![upload("a.png", png_bytes())]);
        let id = batch.id;
        let (returned, err) = process_batch(batch, &engine, &store).await.unwrap_err();

        assert_eq!(returned.id, id);
        assert!(matches!(err, EngineError::ModelUnavailable { .. }));
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_take_is_single_shot() {
        let registry = BatchRegistry::default();
        let batch = UploadBatch::new(Device::Cpu, vec![upload("a.png", png_bytes())]);
        let id = batch.id;
        registry.insert(batch).await;

        assert_eq!(registry.item(id, 0).await.unwrap().file_name, "a.png");
        assert!(registry.item(id, 1).await.is_none());
        assert!(registry.take(id).await.is_some());
        assert!(registry.take(id).await.is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_registry_evicts_oldest_when_full() {
        let registry = BatchRegistry::with_limits(PENDING_TTL, 2);
        let batches: Vec<UploadBatch> = (0..3)
            .map(|i| UploadBatch::new(Device::Cpu, vec![upload(&format!("{i}.png"), png_bytes())]))
            .collect();
        let ids: Vec<Uuid> = batches.iter().map(|b| b.id).collect();
        for batch in batches {
            registry.insert(batch).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(registry.len().await, 2);
        assert!(registry.take(ids[0]).await.is_none());
        assert!(registry.take(ids[1]).await.is_some());
        assert!(registry.take(ids[2]).await.is_some());
    }

    #[tokio::test]
    async fn test_registry_expires_abandoned_batches() {
        let registry = BatchRegistry::with_limits(Duration::from_millis(20), MAX_PENDING);
        let stale = UploadBatch::new(Device::Cpu, vec![upload("old.png", png_bytes())]);
        let stale_id = stale.id;
        registry.insert(stale).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = UploadBatch::new(Device::Cpu, vec![upload("new.png", png_bytes())]);
        let fresh_id = fresh.id;
        registry.insert(fresh).await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.item(stale_id, 0).await.is_none());
        assert!(registry.item(fresh_id, 0).await.is_some());
    }
}
