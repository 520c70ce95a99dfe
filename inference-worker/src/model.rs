//! Shared, lazily-loaded inference sessions, §4.9 step 2 and §5 ("Model
//! pool" — "shared across connections... unloaded when no connection
//! references them. Concurrent `load()` calls for the same identifier
//! coalesce").
//!
//! No machine-learning crate exists anywhere in the pack's dependency
//! graph, so the tensor backend is a pluggable trait, the same shape
//! `ci2::CameraModule`/`ci2::Camera` use to abstract over camera vendors
//! that don't share a common driver library. [`StubBackend`] is the
//! concrete implementation shipped in-tree — a deterministic
//! brightness-threshold detector — so the rest of the pipeline (decode →
//! infer → track → persist) can be built and exercised without a real
//! model file.
//!
//! Loading and inference both run on one dedicated OS thread so the async
//! connection tasks stay responsive to heartbeats (§5, "CPU-bound
//! inference offloaded to a worker thread"). Running everything through
//! that single thread also gets model-load coalescing and reference
//! counting for free: two connections racing to load the same model both
//! land in the same queue and the second one simply finds the model
//! already present. Jobs reach the thread over a `channellib` channel;
//! `crossbeam-ok` drops a reply silently (with a log) if nobody is left to
//! receive it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::decode::DecodedImage;
use crate::error::{Error, Result};

/// One loaded model's ability to run inference on a decoded frame.
pub trait InferenceSession: Send + Sync {
    fn infer(&self, image: &DecodedImage) -> Result<ModelOutput>;
    /// Index-addressed class catalog for this model; `class_id` from
    /// [`ModelOutput`] indexes into it.
    fn class_names(&self) -> &[String];
}

/// A pluggable tensor backend. `load` resolves an opaque model identifier
/// (§3.2's `model` field) to a runnable session sized for `width`x`height`.
pub trait ModelBackend: Send {
    fn load(&self, model: &str, width: u32, height: u32) -> Result<Box<dyn InferenceSession>>;
}

/// Raw model output before class-name mapping / confidence filtering,
/// §4.10 step 2's auto-detected shapes.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// Last-dim-6 rows, each `[x1, y1, x2, y2, conf, cls]`, already
    /// NMS-integrated by the backend.
    NmsIntegrated(Vec<[f32; 6]>),
    /// Dense `[4+C, N]` grid, split into per-box coordinates and per-box
    /// class scores; needs IoU suppression in [`crate::postprocess`].
    Dense {
        boxes: Vec<[f32; 4]>,
        class_scores: Vec<Vec<f32>>,
    },
}

struct LoadedModel {
    session: Arc<dyn InferenceSession>,
    refcount: u32,
}

enum PoolMessage {
    Acquire {
        model: String,
        width: u32,
        height: u32,
        reply: oneshot::Sender<Result<Arc<dyn InferenceSession>>>,
    },
    Release {
        model: String,
    },
    Infer {
        session: Arc<dyn InferenceSession>,
        image: DecodedImage,
        reply: oneshot::Sender<Result<ModelOutput>>,
    },
}

/// A reference to a loaded model. Dropping it releases the pool's
/// refcount; the model is unloaded once the last handle referencing it is
/// dropped.
pub struct ModelHandle {
    model: String,
    session: Arc<dyn InferenceSession>,
    tx: channellib::Sender<PoolMessage>,
}

impl ModelHandle {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn class_names(&self) -> &[String] {
        self.session.class_names()
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        use crossbeam_ok::CrossbeamOk;
        self.tx
            .send(PoolMessage::Release {
                model: self.model.clone(),
            })
            .cb_ok();
    }
}

#[derive(Clone)]
pub struct ModelPool {
    tx: channellib::Sender<PoolMessage>,
}

impl ModelPool {
    /// Spawns the dedicated inference thread and returns a handle to send
    /// it work. The thread runs until every `ModelPool`/`ModelHandle`
    /// clone is dropped and the channel disconnects.
    pub fn spawn(backend: Box<dyn ModelBackend>) -> Self {
        let (tx, rx) = channellib::unbounded::<PoolMessage>();
        std::thread::Builder::new()
            .name("inference-worker-model-pool".into())
            .spawn(move || Self::run(backend, rx))
            .expect("failed to spawn model pool thread");
        Self { tx }
    }

    fn run(backend: Box<dyn ModelBackend>, rx: channellib::Receiver<PoolMessage>) {
        let mut models: HashMap<String, LoadedModel> = HashMap::new();
        loop {
            let msg = match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            };
            match msg {
                PoolMessage::Acquire {
                    model,
                    width,
                    height,
                    reply,
                } => {
                    let result = match models.get_mut(&model) {
                        Some(entry) => {
                            entry.refcount += 1;
                            Ok(entry.session.clone())
                        }
                        None => match backend.load(&model, width, height) {
                            Ok(session) => {
                                let session: Arc<dyn InferenceSession> = Arc::from(session);
                                info!(%model, "model loaded");
                                models.insert(
                                    model.clone(),
                                    LoadedModel {
                                        session: session.clone(),
                                        refcount: 1,
                                    },
                                );
                                Ok(session)
                            }
                            Err(err) => Err(err),
                        },
                    };
                    let _ = reply.send(result);
                }
                PoolMessage::Release { model } => {
                    if let Some(entry) = models.get_mut(&model) {
                        entry.refcount = entry.refcount.saturating_sub(1);
                        if entry.refcount == 0 {
                            models.remove(&model);
                            info!(%model, "model unloaded, no remaining connections");
                        }
                    }
                }
                PoolMessage::Infer {
                    session,
                    image,
                    reply,
                } => {
                    let _ = reply.send(session.infer(&image));
                }
            }
        }
        warn!("model pool thread exiting: channel disconnected");
    }

    /// Loads (or joins an already-loading/loaded) model. Concurrent
    /// requests for the same identifier all funnel through the one pool
    /// thread, so they coalesce naturally.
    pub async fn acquire(
        &self,
        model: impl Into<String>,
        width: u32,
        height: u32,
    ) -> Result<ModelHandle> {
        let model = model.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::Acquire {
                model: model.clone(),
                width,
                height,
                reply: reply_tx,
            })
            .map_err(|_| Error::ModelPoolGone)?;
        let session = reply_rx.await.map_err(|_| Error::ModelPoolGone)??;
        Ok(ModelHandle {
            model,
            session,
            tx: self.tx.clone(),
        })
    }

    /// Runs inference on the pool's dedicated thread, keeping the
    /// CPU-bound call off the connection's async task (§5).
    pub async fn infer(&self, handle: &ModelHandle, image: DecodedImage) -> Result<ModelOutput> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::Infer {
                session: handle.session.clone(),
                image,
                reply: reply_tx,
            })
            .map_err(|_| Error::ModelPoolGone)?;
        reply_rx.await.map_err(|_| Error::ModelPoolGone)?
    }
}

/// Deterministic stand-in backend: thresholds average luma in a coarse
/// grid and emits one detection per cell whose brightness clears the
/// threshold, all tagged with a single synthetic class.
pub struct StubBackend {
    pub grid: u32,
    pub threshold: u8,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            grid: 4,
            threshold: 96,
        }
    }
}

impl ModelBackend for StubBackend {
    fn load(&self, model: &str, width: u32, height: u32) -> Result<Box<dyn InferenceSession>> {
        if model.is_empty() {
            return Err(Error::ModelLoad {
                model: model.to_string(),
                message: "model identifier must not be empty".to_string(),
            });
        }
        Ok(Box::new(StubSession {
            grid: self.grid,
            threshold: self.threshold,
            class_names: vec!["object".to_string()],
        }))
    }
}

struct StubSession {
    grid: u32,
    threshold: u8,
    class_names: Vec<String>,
}

impl InferenceSession for StubSession {
    fn infer(&self, image: &DecodedImage) -> Result<ModelOutput> {
        let cell_w = (image.width / self.grid).max(1);
        let cell_h = (image.height / self.grid).max(1);
        let mut rows = Vec::new();
        for gy in 0..self.grid {
            for gx in 0..self.grid {
                let x0 = gx * cell_w;
                let y0 = gy * cell_h;
                let x1 = (x0 + cell_w).min(image.width);
                let y1 = (y0 + cell_h).min(image.height);
                if x1 <= x0 || y1 <= y0 {
                    continue;
                }
                let avg = average_luma(image, x0, y0, x1, y1);
                if avg >= self.threshold {
                    let confidence = (avg as f32 / 255.0).min(0.99);
                    rows.push([x0 as f32, y0 as f32, x1 as f32, y1 as f32, confidence, 0.0]);
                }
            }
        }
        Ok(ModelOutput::NmsIntegrated(rows))
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

fn average_luma(image: &DecodedImage, x0: u32, y0: u32, x1: u32, y1: u32) -> u8 {
    let mut sum: u64 = 0;
    let mut count: u64 = 0;
    for y in y0..y1 {
        for x in x0..x1 {
            let idx = (y as usize * image.width as usize + x as usize) * 3;
            if idx + 2 < image.rgb.len() {
                let r = image.rgb[idx] as u64;
                let g = image.rgb[idx + 1] as u64;
                let b = image.rgb[idx + 2] as u64;
                sum += (r * 299 + g * 587 + b * 114) / 1000;
                count += 1;
            }
        }
    }
    if count == 0 {
        0
    } else {
        (sum / count) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_image(width: u32, height: u32, value: u8) -> DecodedImage {
        DecodedImage {
            width,
            height,
            rgb: vec![value; (width * height * 3) as usize],
        }
    }

    #[test]
    fn stub_session_detects_bright_cells_only() {
        let session = StubSession {
            grid: 2,
            threshold: 128,
            class_names: vec!["object".to_string()],
        };
        let image = solid_image(4, 4, 200);
        let out = session.infer(&image).unwrap();
        match out {
            ModelOutput::NmsIntegrated(rows) => assert_eq!(rows.len(), 4),
            _ => panic!("expected NMS-integrated output"),
        }
    }

    #[test]
    fn stub_session_detects_nothing_below_threshold() {
        let session = StubSession {
            grid: 2,
            threshold: 128,
            class_names: vec!["object".to_string()],
        };
        let image = solid_image(4, 4, 10);
        let out = session.infer(&image).unwrap();
        match out {
            ModelOutput::NmsIntegrated(rows) => assert!(rows.is_empty()),
            _ => panic!("expected NMS-integrated output"),
        }
    }

    #[tokio::test]
    async fn pool_coalesces_concurrent_loads_of_same_model() {
        let pool = ModelPool::spawn(Box::new(StubBackend::default()));
        let (a, b) = tokio::join!(
            pool.acquire("yolo", 64, 64),
            pool.acquire("yolo", 64, 64)
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn pool_rejects_empty_model_identifier() {
        let pool = ModelPool::spawn(Box::new(StubBackend::default()));
        assert!(pool.acquire("", 64, 64).await.is_err());
    }
}
