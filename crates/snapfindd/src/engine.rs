use image::DynamicImage;
use snapfind_core::{Caption, CaptionError, Captioner, Device};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("caption model unavailable on {device}: {source}")]
    ModelUnavailable {
        device: Device,
        #[source]
        source: CaptionError,
    },
    #[error("caption failed: {0}")]
    Caption(#[from] CaptionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Loads a captioner for a device. Called at most once per successful device.
pub type CaptionerLoader =
    Box<dyn FnMut(Device) -> Result<Box<dyn Captioner>, CaptionError> + Send>;

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Caption {
        image: DynamicImage,
        device: Device,
        reply: oneshot::Sender<Result<Caption, EngineError>>,
    },
    LoadedDevices {
        reply: oneshot::Sender<Vec<Device>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Caption one image on `device`, loading that device's model on first use.
    pub async fn caption(&self, image: DynamicImage, device: Device) -> Result<Caption, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Caption {
                image,
                device,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Devices whose model is currently loaded.
    pub async fn loaded_devices(&self) -> Result<Vec<Device>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::LoadedDevices { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns every loaded model, so inference needs no locking. When
/// `preload` is set that device's model is loaded before the first request;
/// a failure there is logged and retried on the next caption request.
pub fn spawn_engine(
    mut load: CaptionerLoader,
    preload: Option<Device>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("snapfind-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut models: HashMap<Device, Box<dyn Captioner>> = HashMap::new();

            if let Some(device) = preload {
                if let Err(e) = ensure_loaded(&mut models, &mut load, device) {
                    tracing::warn!(error = %e, "startup model load failed; captioning unavailable until it loads");
                }
            }

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Caption {
                        image,
                        device,
                        reply,
                    } => {
                        let result = run_caption(&mut models, &mut load, &image, device);
                        let _ = reply.send(result);
                    }
                    EngineRequest::LoadedDevices { reply } => {
                        let mut devices: Vec<Device> = models.keys().copied().collect();
                        devices.sort_by_key(|d| d.as_str());
                        let _ = reply.send(devices);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn ensure_loaded<'a>(
    models: &'a mut HashMap<Device, Box<dyn Captioner>>,
    load: &mut CaptionerLoader,
    device: Device,
) -> Result<&'a mut Box<dyn Captioner>, EngineError> {
    match models.entry(device) {
        Entry::Occupied(slot) => Ok(slot.into_mut()),
        Entry::Vacant(slot) => {
            let model = load(device).map_err(|source| EngineError::ModelUnavailable { device, source })?;
            tracing::info!(%device, "caption model loaded");
            Ok(slot.insert(model))
        }
    }
}

fn run_caption(
    models: &mut HashMap<Device, Box<dyn Captioner>>,
    load: &mut CaptionerLoader,
    image: &DynamicImage,
    device: Device,
) -> Result<Caption, EngineError> {
    let model = ensure_loaded(models, load, device)?;
    let started = std::time::Instant::now();
    let caption = model.caption(image)?;
    tracing::debug!(
        %device,
        elapsed_ms = started.elapsed().as_millis() as u64,
        caption = %caption,
        "caption: done"
    );
    Ok(caption)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Captioner that always answers with the same text.
    pub(crate) struct FixedCaptioner(pub &'static str);

    impl Captioner for FixedCaptioner {
        fn caption(&mut self, _image: &DynamicImage) -> Result<Caption, CaptionError> {
            Ok(Caption::new(self.0))
        }
    }

    pub(crate) fn fixed_loader(text: &'static str) -> CaptionerLoader {
        Box::new(move |_device| Ok(Box::new(FixedCaptioner(text)) as Box<dyn Captioner>))
    }

    pub(crate) fn failing_loader() -> CaptionerLoader {
        Box::new(|device| {
            Err(CaptionError::DeviceUnavailable {
                device,
                reason: "no CUDA runtime".into(),
            })
        })
    }

    #[tokio::test]
    async fn test_caption_loads_once_per_device() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let loader: CaptionerLoader = Box::new(move |_device| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FixedCaptioner("a dog")) as Box<dyn Captioner>)
        });

        let engine = spawn_engine(loader, None).unwrap();
        let image = DynamicImage::new_rgb8(4, 4);
        for _ in 0..3 {
            let caption = engine.caption(image.clone(), Device::Cpu).await.unwrap();
            assert_eq!(caption.as_str(), "a dog");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        engine.caption(image, Device::Cuda).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(engine.loaded_devices().await.unwrap(), vec![Device::Cpu, Device::Cuda]);
    }

    #[tokio::test]
    async fn test_preload() {
        let engine = spawn_engine(fixed_loader("x"), Some(Device::Cpu)).unwrap();
        assert_eq!(engine.loaded_devices().await.unwrap(), vec![Device::Cpu]);
    }

    #[tokio::test]
    async fn test_load_failure_is_model_unavailable() {
        let engine = spawn_engine(failing_loader(), Some(Device::Cuda)).unwrap();
        let err = engine
            .caption(DynamicImage::new_rgb8(4, 4), Device::Cuda)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelUnavailable { device: Device::Cuda, .. }));
        assert!(engine.loaded_devices().await.unwrap().is_empty());
    }
}
