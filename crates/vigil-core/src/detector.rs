//! SCRFD face model via ONNX Runtime.
//!
//! Anchor-free 3-stride decoding with NMS post-processing. Used as the
//! downloadable fallback backend when the platform has no native detector.
//! Only boxes are decoded; keypoint outputs, when the export has them, are
//! ignored.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::execution_providers::ExecutionProviderDispatch;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// score + bbox per stride; keypoint exports add three more.
const SCRFD_MIN_OUTPUTS: usize = 6;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("execution backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("ML runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).min(target);
        let new_h = ((height as f32 * scale).round() as usize).min(target);
        Self {
            scale,
            pad_x: (target - new_w) as f32 / 2.0,
            pad_y: (target - new_h) as f32 / 2.0,
        }
    }

    /// Map a point from model input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    input_size: usize,
    /// Output indices for strides [8, 16, 32], discovered at load time.
    strides: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD model on the default (CPU) execution path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        Self::load_with(model_path, Vec::new())
    }

    /// Load the SCRFD model, registering `providers` on the session.
    ///
    /// Providers built with `error_on_failure` make session creation fail
    /// instead of silently dropping to CPU.
    pub fn load_with(
        model_path: &str,
        providers: Vec<ExecutionProviderDispatch>,
    ) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let mut builder = Session::builder()?.with_intra_threads(2)?;
        if !providers.is_empty() {
            builder = builder.with_execution_providers(providers)?;
        }
        let session = builder.commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < SCRFD_MIN_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least {SCRFD_MIN_OUTPUTS} outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let strides = discover_stride_outputs(&output_names);
        tracing::debug!(?strides, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_size: SCRFD_INPUT_SIZE,
            strides,
        })
    }

    /// Detect faces in a grayscale frame. Boxes are in frame pixels, highest
    /// confidence first.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = (width as usize, height as usize);
        if width == 0 || height == 0 || frame.len() < width * height {
            return Err(DetectorError::InferenceFailed(format!(
                "frame buffer too short: {width}x{height} needs {} bytes, got {}",
                width * height,
                frame.len()
            )));
        }

        let letterbox = Letterbox::fit(width, height, self.input_size);
        let input = preprocess(frame, width, height, self.input_size, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let StrideOutputs { score, bbox } = self.strides[slot];

            let (_, scores) = outputs[score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox a grayscale frame into a normalized 3-channel NCHW tensor.
fn preprocess(
    frame: &[u8],
    width: usize,
    height: usize,
    input_size: usize,
    letterbox: &Letterbox,
) -> Array4<f32> {
    let new_w = ((width as f32 * letterbox.scale).round() as usize).min(input_size);
    let new_h = ((height as f32 * letterbox.scale).round() as usize).min(input_size);
    let resized = resize_bilinear(frame, width, height, new_w, new_h, letterbox.scale);

    let x0 = letterbox.pad_x.floor() as usize;
    let y0 = letterbox.pad_y.floor() as usize;

    // Zeros already encode padding: (SCRFD_MEAN - SCRFD_MEAN) / SCRFD_STD.
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    for y in 0..new_h {
        for x in 0..new_w {
            let v = (resized[y * new_w + x] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y0 + y, x0 + x]] = v;
            }
        }
    }
    tensor
}

/// Bilinear resize of a grayscale buffer by `scale`.
fn resize_bilinear(
    frame: &[u8],
    width: usize,
    height: usize,
    new_w: usize,
    new_h: usize,
    scale: f32,
) -> Vec<u8> {
    let inv_scale = 1.0 / scale;
    let sample = |src: f32, len: usize| {
        let i0 = (src.floor() as i32).clamp(0, len as i32 - 1) as usize;
        let i1 = (i0 + 1).min(len - 1);
        let t = (src - src.floor()).clamp(0.0, 1.0);
        (i0, i1, t)
    };

    let mut resized = vec![0u8; new_w * new_h];
    for y in 0..new_h {
        let (y0, y1, fy) = sample((y as f32 + 0.5) * inv_scale - 0.5, height);
        for x in 0..new_w {
            let (x0, x1, fx) = sample((x as f32 + 0.5) * inv_scale - 0.5, width);

            let top = frame[y0 * width + x0] as f32 * (1.0 - fx) + frame[y0 * width + x1] as f32 * fx;
            let bottom = frame[y1 * width + x0] as f32 * (1.0 - fx) + frame[y1 * width + x1] as f32 * fx;
            let val = top * (1.0 - fy) + bottom * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    resized
}

/// Map output tensors to stride slots.
///
/// Exports that name their tensors `score_8`, `bbox_16`, ... are mapped by
/// name. Anything else uses the standard positional layout: scores for
/// strides 8/16/32 first, then bboxes.
fn discover_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
            })
        })
        .collect();

    match named {
        Some(slots) => [slots[0], slots[1], slots[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideOutputs { score: i, bbox: i + 3 })
        }
    }
}

/// Decode boxes above `threshold` for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input_size / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.unmap(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = letterbox.unmap(cx + offsets[2] * step, cy + offsets[3] * step);

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| k.iou(&det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}
