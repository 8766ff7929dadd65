use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, RgbaImage, imageops::FilterType};
use ndarray::{Array4, CowArray};
use once_cell::sync::Lazy;
use ort::{
    GraphOptimizationLevel, SessionBuilder, environment::Environment, session::Session as OrtSession,
    tensor::OrtOwnedTensor, value::Value,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application phase. Exactly one is active at any time; it is the sole
/// source of truth for what is visible and what the action button does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Initial,
    LoadingModel,
    AwaitingUpload,
    Ready,
    Classifying,
    Complete,
}

/// The only event the machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Next,
}

/// Fixed transition table. The six phases form a cycle that returns to
/// `AwaitingUpload` after `Complete`, never back to `Initial`.
pub fn transition(phase: Phase, event: Event) -> Phase {
    match (phase, event) {
        (Phase::Initial, Event::Next) => Phase::LoadingModel,
        (Phase::LoadingModel, Event::Next) => Phase::AwaitingUpload,
        (Phase::AwaitingUpload, Event::Next) => Phase::Ready,
        (Phase::Ready, Event::Next) => Phase::Classifying,
        (Phase::Classifying, Event::Next) => Phase::Complete,
        (Phase::Complete, Event::Next) => Phase::AwaitingUpload,
    }
}

/// Visibility flags derived from the active phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayFlags {
    /// True for `Ready` and `Complete`.
    pub show_image: bool,
    /// True for `Complete` only.
    pub show_results: bool,
}

pub fn display_flags(phase: Phase) -> DisplayFlags {
    match phase {
        Phase::Ready => DisplayFlags {
            show_image: true,
            show_results: false,
        },
        Phase::Complete => DisplayFlags {
            show_image: true,
            show_results: true,
        },
        _ => DisplayFlags::default(),
    }
}

/// What pressing the action button does in a given phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    LoadModel,
    /// In-flight phases keep the button a no-op so the running workflow
    /// cannot be re-triggered.
    Noop,
    PickPhoto,
    Classify,
    Advance,
}

/// Button label and behavior for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSpec {
    pub label: &'static str,
    pub action: Action,
}

pub fn action_spec(phase: Phase) -> ActionSpec {
    match phase {
        Phase::Initial => ActionSpec {
            label: "Load model",
            action: Action::LoadModel,
        },
        Phase::LoadingModel => ActionSpec {
            label: "Loading model...",
            action: Action::Noop,
        },
        Phase::AwaitingUpload => ActionSpec {
            label: "Upload a photo",
            action: Action::PickPhoto,
        },
        Phase::Ready => ActionSpec {
            label: "Identify image",
            action: Action::Classify,
        },
        Phase::Classifying => ActionSpec {
            label: "Identifying...",
            action: Action::Noop,
        },
        Phase::Complete => ActionSpec {
            label: "Try another",
            action: Action::Advance,
        },
    }
}

/// One classifier guess: label plus probability in [0,1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f32,
}

/// Display form of a prediction, e.g. `cat: 87.00%`.
pub fn format_prediction(p: &Prediction) -> String {
    format!("{}: {:.2}%", p.label, p.probability * 100.0)
}

/// An image classifier. Results are ordered by descending probability.
pub trait Classifier: Send + Sync {
    fn classify(&self, image: &Path) -> Result<Vec<Prediction>>;
}

/// Structural errors from the session dispatcher. Unreachable as long as
/// events arrive through the phase-gated button, but propagated rather
/// than swallowed when they do occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("classification requested but no model is loaded")]
    ModelNotLoaded,
    #[error("classification requested but no image has been uploaded")]
    NoImage,
}

/// Inputs the session reacts to, delivered to [`Session::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// The single action button was pressed.
    ActionPressed,
    /// The file chooser closed with zero or more selected files.
    FilesSelected(Vec<PathBuf>),
}

/// Side effect the driver must perform after a dispatch. The session
/// only advances phases and stores data; actually loading the model and
/// running the classifier happen outside, and complete through
/// [`Session::finish_model_load`] / [`Session::finish_classification`].
pub enum Effect {
    LoadModel,
    OpenFilePicker,
    Classify {
        model: Arc<dyn Classifier>,
        image: PathBuf,
    },
}

/// One user session: the active phase plus the three pieces of data the
/// workflows produce. All mutation funnels through `dispatch` and the
/// two `finish_*` completions.
pub struct Session {
    phase: Phase,
    model: Option<Arc<dyn Classifier>>,
    image: Option<PathBuf>,
    results: Vec<Prediction>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Initial,
            model: None,
            image: None,
            results: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn flags(&self) -> DisplayFlags {
        display_flags(self.phase)
    }

    pub fn action(&self) -> ActionSpec {
        action_spec(self.phase)
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    pub fn results(&self) -> &[Prediction] {
        &self.results
    }

    /// Apply the `Next` event to the active phase.
    pub fn advance(&mut self) {
        self.phase = transition(self.phase, Event::Next);
    }

    /// Single dispatcher for UI events. Performs the synchronous part of
    /// the phase-bound workflow and returns the side effect, if any, the
    /// driver has to carry out.
    pub fn dispatch(&mut self, event: UiEvent) -> Result<Option<Effect>, SessionError> {
        match event {
            UiEvent::ActionPressed => match self.action().action {
                Action::LoadModel => {
                    self.advance();
                    Ok(Some(Effect::LoadModel))
                }
                Action::Noop => Ok(None),
                Action::PickPhoto => Ok(Some(Effect::OpenFilePicker)),
                Action::Classify => {
                    // Both transitions happen before the classify call is
                    // even issued; the phase reads `Complete` while the
                    // classifier is still running and the results arrive
                    // through `finish_classification` afterwards.
                    self.advance();
                    self.advance();
                    let model = self.model.clone().ok_or(SessionError::ModelNotLoaded)?;
                    let image = self.image.clone().ok_or(SessionError::NoImage)?;
                    Ok(Some(Effect::Classify { model, image }))
                }
                Action::Advance => {
                    // Back to `AwaitingUpload`; stale image and results
                    // stay in place until the next cycle overwrites them.
                    self.advance();
                    Ok(None)
                }
            },
            UiEvent::FilesSelected(files) => {
                // Zero files selected is a silent no-op. Only the first
                // file is kept; extras are ignored.
                if let Some(first) = files.first() {
                    self.image = Some(first.clone());
                    self.advance();
                }
                Ok(None)
            }
        }
    }

    /// Completion of the model-load effect: store the handle and move on
    /// to `AwaitingUpload`.
    pub fn finish_model_load(&mut self, model: Arc<dyn Classifier>) {
        self.model = Some(model);
        self.advance();
    }

    /// Completion of the classify effect: replace any prior results. No
    /// phase change, the machine already sits at `Complete`.
    pub fn finish_classification(&mut self, results: Vec<Prediction>) {
        self.results = results;
    }
}

static ORT_ENV: Lazy<Arc<Environment>> = Lazy::new(|| {
    Environment::builder()
        .with_name("photo-identify")
        .build()
        .expect("failed to initialize ONNX Runtime environment")
        .into_arc()
});

/// Configuration for the ONNX-based MobileNet classifier.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub input_size: u32,
    /// How many top predictions to report.
    pub top_k: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/mobilenet_v2.onnx"),
            labels_path: PathBuf::from("models/labels.txt"),
            input_size: 224,
            top_k: 3,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

/// MobileNet classifier backed by ONNX Runtime.
#[derive(Debug)]
pub struct MobileNetOrt {
    session: OrtSession,
    labels: Vec<String>,
    input_size: u32,
    top_k: usize,
    mean: [f32; 3],
    std: [f32; 3],
}

impl MobileNetOrt {
    pub fn load(cfg: &ClassifierConfig) -> Result<Self> {
        if !cfg.model_path.exists() {
            anyhow::bail!("Model file missing: {}", cfg.model_path.to_string_lossy());
        }
        if !cfg.labels_path.exists() {
            anyhow::bail!("Labels file missing: {}", cfg.labels_path.to_string_lossy());
        }
        let env = ORT_ENV.clone();
        let session = SessionBuilder::new(&env)?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_model_from_file(&cfg.model_path)?;

        let labels_raw = fs::read_to_string(&cfg.labels_path).context("cannot read labels")?;
        let labels = parse_labels(&labels_raw);
        if labels.is_empty() {
            anyhow::bail!("labels file contains no labels");
        }

        Ok(Self {
            session,
            labels,
            input_size: cfg.input_size,
            top_k: cfg.top_k,
            mean: cfg.mean,
            std: cfg.std,
        })
    }

    fn prepare_input(&self, path: &Path) -> Result<Array4<f32>> {
        let img = image::open(path)
            .with_context(|| format!("cannot open image: {}", path.display()))?;
        let resized = resize_to_square(img, self.input_size);
        let mut array =
            Array4::<f32>::zeros((1, 3, self.input_size as usize, self.input_size as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let [r, g, b, _] = pixel.0;
            let coords = (y as usize, x as usize);
            array[[0, 0, coords.0, coords.1]] = normalize_channel(r, self.mean[0], self.std[0]);
            array[[0, 1, coords.0, coords.1]] = normalize_channel(g, self.mean[1], self.std[1]);
            array[[0, 2, coords.0, coords.1]] = normalize_channel(b, self.mean[2], self.std[2]);
        }
        Ok(array)
    }
}

impl Classifier for MobileNetOrt {
    fn classify(&self, image: &Path) -> Result<Vec<Prediction>> {
        let tensor = self.prepare_input(image)?;
        let input_array = tensor.into_dyn();
        let cow = CowArray::from(input_array.view());
        let input = Value::from_array(self.session.allocator(), &cow)
            .map_err(|e| anyhow!("could not build input tensor: {e}"))?;
        let outputs: Vec<Value> = self.session.run(vec![input])?;
        if outputs.is_empty() {
            anyhow::bail!("model produced no output");
        }
        let logits: OrtOwnedTensor<f32, _> = outputs[0].try_extract()?;
        let view = logits.view();
        let scores: Vec<f32> = view.iter().cloned().collect();
        if scores.is_empty() {
            anyhow::bail!("empty logits");
        }
        if scores.len() != self.labels.len() {
            tracing::warn!(
                "label count {} does not match logit count {}",
                self.labels.len(),
                scores.len()
            );
        }
        let probs = softmax(&scores);
        let mut predictions: Vec<Prediction> = probs
            .iter()
            .enumerate()
            .map(|(idx, &probability)| Prediction {
                label: self
                    .labels
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{idx}")),
                probability,
            })
            .collect();
        predictions.sort_by(|a, b| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions.truncate(self.top_k);
        Ok(predictions)
    }
}

fn parse_labels(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect()
}

fn resize_to_square(img: DynamicImage, size: u32) -> RgbaImage {
    img.resize_exact(size, size, FilterType::Triangle)
        .to_rgba8()
}

fn normalize_channel(value: u8, mean: f32, std: f32) -> f32 {
    let v = value as f32 / 255.0;
    (v - mean) / std
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|x| x / sum).collect()
}
