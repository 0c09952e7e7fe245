use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use ndarray::Array4;
use serde::Serialize;
use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Tensor};

use crate::error::{ModelError, PredictError};
use crate::labels::LabelEncoder;
use crate::preprocess::preprocess;

/// How the raw model output is turned into a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPolicy {
    /// Return the per-class output vector as is.
    Raw,
    /// Argmax over classes, decoded through the label encoder.
    Label,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Prediction {
    Scores(Vec<f32>),
    Label(String),
}

/// Runs one preprocessed batch through a trained model.
pub trait Classifier: Send + Sync {
    fn classify(&self, input: &Array4<f32>) -> Result<Vec<f32>, String>;
}

/// A TensorFlow frozen graph with a named input and output operation.
#[derive(Debug)]
pub struct TfClassifier {
    session: Session,
    graph: Graph,
    input_op: String,
    output_op: String,
}

impl TfClassifier {
    pub fn load(model_path: &Path, input_op: &str, output_op: &str) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::NotFound(model_path.to_path_buf()));
        }
        let failure = |reason: String| ModelError::LoadFailure {
            path: model_path.to_path_buf(),
            reason,
        };

        let mut model_bytes = Vec::new();
        File::open(model_path)
            .and_then(|mut f| f.read_to_end(&mut model_bytes))
            .map_err(|e| failure(e.to_string()))?;

        let mut graph = Graph::new();
        graph
            .import_graph_def(&model_bytes, &ImportGraphDefOptions::new())
            .map_err(|e| failure(e.to_string()))?;

        for op in [input_op, output_op] {
            graph
                .operation_by_name_required(op)
                .map_err(|e| failure(format!("operation '{op}': {e}")))?;
        }

        let session =
            Session::new(&SessionOptions::new(), &graph).map_err(|e| failure(e.to_string()))?;

        Ok(TfClassifier {
            session,
            graph,
            input_op: input_op.to_string(),
            output_op: output_op.to_string(),
        })
    }
}

impl Classifier for TfClassifier {
    fn classify(&self, input: &Array4<f32>) -> Result<Vec<f32>, String> {
        let dims: Vec<u64> = input.shape().iter().map(|&d| d as u64).collect();
        let values: Vec<f32> = input.iter().copied().collect();
        let input_tensor = Tensor::new(&dims)
            .with_values(&values)
            .map_err(|e| e.to_string())?;

        let input_operation = self
            .graph
            .operation_by_name_required(&self.input_op)
            .map_err(|e| e.to_string())?;
        let output_operation = self
            .graph
            .operation_by_name_required(&self.output_op)
            .map_err(|e| e.to_string())?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_operation, 0, &input_tensor);
        let output_token = args.request_fetch(&output_operation, 0);
        self.session.run(&mut args).map_err(|e| e.to_string())?;

        let output_tensor: Tensor<f32> = args.fetch(output_token).map_err(|e| e.to_string())?;
        Ok(output_tensor.to_vec())
    }
}

pub struct ModelConfig {
    pub model_path: PathBuf,
    pub label_encoder_path: Option<PathBuf>,
    pub input_op: String,
    pub output_op: String,
    pub policy: OutputPolicy,
}

/// The loaded model and label encoder. Built once at startup and shared
/// read-only between requests.
pub struct ModelService {
    classifier: Box<dyn Classifier>,
    encoder: Option<LabelEncoder>,
    policy: OutputPolicy,
}

impl std::fmt::Debug for ModelService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelService")
            .field("encoder", &self.encoder)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ModelService {
    pub fn load(config: &ModelConfig) -> Result<Self, ModelError> {
        if config.policy == OutputPolicy::Label && config.label_encoder_path.is_none() {
            return Err(ModelError::MissingLabelEncoder);
        }

        tracing::info!(path = %config.model_path.display(), "loading model");
        let classifier = TfClassifier::load(&config.model_path, &config.input_op, &config.output_op)?;
        tracing::info!(
            input = %config.input_op,
            output = %config.output_op,
            "model loaded"
        );

        let encoder = load_encoder(config)?;

        Self::new(Box::new(classifier), encoder, config.policy)
    }

    pub fn new(
        classifier: Box<dyn Classifier>,
        encoder: Option<LabelEncoder>,
        policy: OutputPolicy,
    ) -> Result<Self, ModelError> {
        if policy == OutputPolicy::Label && encoder.is_none() {
            return Err(ModelError::MissingLabelEncoder);
        }
        Ok(ModelService {
            classifier,
            encoder,
            policy,
        })
    }

    pub fn policy(&self) -> OutputPolicy {
        self.policy
    }

    pub fn predict(&self, image_data: &[u8]) -> Result<Prediction, PredictError> {
        let input = preprocess(image_data)?;
        let scores = self
            .classifier
            .classify(&input)
            .map_err(PredictError::Prediction)?;

        match (self.policy, &self.encoder) {
            (OutputPolicy::Raw, _) => Ok(Prediction::Scores(scores)),
            (OutputPolicy::Label, Some(encoder)) => {
                let index = argmax(&scores)?;
                let label = encoder.decode(index).ok_or_else(|| {
                    PredictError::Prediction(format!(
                        "class index {index} outside the {} known labels",
                        encoder.len()
                    ))
                })?;
                Ok(Prediction::Label(label.to_string()))
            }
            (OutputPolicy::Label, None) => Err(PredictError::Prediction(
                "no label encoder loaded".into(),
            )),
        }
    }
}

/// The raw policy never decodes, so its encoder is not read at all.
fn load_encoder(config: &ModelConfig) -> Result<Option<LabelEncoder>, ModelError> {
    match (config.policy, &config.label_encoder_path) {
        (OutputPolicy::Label, Some(path)) => {
            tracing::info!(path = %path.display(), "loading label encoder");
            let encoder = LabelEncoder::load(path)?;
            tracing::info!(classes = encoder.len(), "label encoder loaded");
            Ok(Some(encoder))
        }
        (OutputPolicy::Label, None) => Err(ModelError::MissingLabelEncoder),
        (OutputPolicy::Raw, _) => Ok(None),
    }
}

/// Index of the highest score; ties resolve to the lowest index.
fn argmax(scores: &[f32]) -> Result<usize, PredictError> {
    if scores.iter().any(|s| s.is_nan()) {
        return Err(PredictError::Prediction("model output contains NaN".into()));
    }

    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
        .map(|(i, _)| i)
        .ok_or_else(|| PredictError::Prediction("model returned an empty output".into()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};

    use super::*;
    use crate::error::PreprocessingError;

    /// Scores each class by its distance to the mean brightness of the input.
    struct BrightnessClassifier {
        classes: usize,
    }

    impl Classifier for BrightnessClassifier {
        fn classify(&self, input: &Array4<f32>) -> Result<Vec<f32>, String> {
            assert_eq!(input.shape(), &[1, 128, 128, 1]);
            let mean = input.mean().unwrap_or(0.0);
            Ok((0..self.classes)
                .map(|c| {
                    let centre = (c as f32 + 0.5) / self.classes as f32;
                    1.0 - (mean - centre).abs()
                })
                .collect())
        }
    }

    struct Fixed(Vec<f32>);

    impl Classifier for Fixed {
        fn classify(&self, _: &Array4<f32>) -> Result<Vec<f32>, String> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl Classifier for Broken {
        fn classify(&self, _: &Array4<f32>) -> Result<Vec<f32>, String> {
            Err("incompatible shapes: [1,128,128,1] vs. [1,64,64,3]".into())
        }
    }

    const TRAITS: &str = "Openness\nConscientiousness\nExtraversion\nAgreeableness\nNeuroticism\n";

    fn five_traits() -> LabelEncoder {
        LabelEncoder::from_lines(TRAITS).unwrap()
    }

    fn gray_png(value: u8) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(256, 256, Rgb([value, value, value]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn label_policy_decodes_argmax() {
        let service = ModelService::new(
            Box::new(Fixed(vec![0.1, 0.05, 0.6, 0.2, 0.05])),
            Some(five_traits()),
            OutputPolicy::Label,
        )
        .unwrap();

        let prediction = service.predict(&gray_png(40)).unwrap();
        assert_eq!(prediction, Prediction::Label("Extraversion".into()));
    }

    #[test]
    fn label_policy_returns_known_label_for_any_brightness() {
        let encoder = five_traits();
        let service = ModelService::new(
            Box::new(BrightnessClassifier { classes: 5 }),
            Some(encoder.clone()),
            OutputPolicy::Label,
        )
        .unwrap();

        for value in [0u8, 60, 128, 200, 255] {
            match service.predict(&gray_png(value)).unwrap() {
                Prediction::Label(label) => assert!(encoder.labels().contains(&label)),
                other => panic!("expected a label, got {other:?}"),
            }
        }
        assert_eq!(
            service.predict(&gray_png(255)).unwrap(),
            Prediction::Label("Neuroticism".into())
        );
    }

    #[test]
    fn raw_policy_returns_scores() {
        let scores = vec![0.25, 0.75];
        let service =
            ModelService::new(Box::new(Fixed(scores.clone())), None, OutputPolicy::Raw).unwrap();

        assert_eq!(service.predict(&gray_png(1)).unwrap(), Prediction::Scores(scores));
    }

    #[test]
    fn prediction_is_deterministic() {
        let service = ModelService::new(
            Box::new(BrightnessClassifier { classes: 5 }),
            None,
            OutputPolicy::Raw,
        )
        .unwrap();
        let bytes = gray_png(99);

        assert_eq!(service.predict(&bytes).unwrap(), service.predict(&bytes).unwrap());
    }

    #[test]
    fn empty_bytes_are_a_preprocessing_error() {
        let service =
            ModelService::new(Box::new(Broken), Some(five_traits()), OutputPolicy::Label).unwrap();

        let err = service.predict(&[]).unwrap_err();
        assert!(matches!(err, PredictError::Preprocessing(PreprocessingError::Empty)));
    }

    #[test]
    fn model_failure_is_a_prediction_error() {
        let service = ModelService::new(Box::new(Broken), None, OutputPolicy::Raw).unwrap();

        let err = service.predict(&gray_png(10)).unwrap_err();
        assert!(matches!(err, PredictError::Prediction(_)));
    }

    #[test]
    fn out_of_range_class_is_never_returned() {
        let service = ModelService::new(
            Box::new(Fixed(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.9])),
            Some(five_traits()),
            OutputPolicy::Label,
        )
        .unwrap();

        let err = service.predict(&gray_png(10)).unwrap_err();
        assert!(matches!(err, PredictError::Prediction(_)));
    }

    #[test]
    fn label_policy_without_encoder_is_rejected() {
        let err = ModelService::new(Box::new(Broken), None, OutputPolicy::Label).unwrap_err();
        assert!(matches!(err, ModelError::MissingLabelEncoder));
    }

    #[test]
    fn argmax_edge_cases() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]).unwrap(), 1);
        assert_eq!(argmax(&[-5.0, -1.0]).unwrap(), 1);
        assert!(argmax(&[]).is_err());
        assert!(argmax(&[0.1, f32::NAN]).is_err());
    }

    #[test]
    fn missing_model_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            model_path: dir.path().join("graphology_model.pb"),
            label_encoder_path: None,
            input_op: "x".into(),
            output_op: "Identity".into(),
            policy: OutputPolicy::Raw,
        };

        let err = ModelService::load(&config).unwrap_err();
        assert!(matches!(err, ModelError::NotFound(path) if path == config.model_path));
    }

    fn encoder_config(policy: OutputPolicy, label_encoder_path: Option<PathBuf>) -> ModelConfig {
        ModelConfig {
            model_path: PathBuf::from("graphology_model.pb"),
            label_encoder_path,
            input_op: "x".into(),
            output_op: "Identity".into(),
            policy,
        }
    }

    #[test]
    fn raw_policy_ignores_missing_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let config = encoder_config(OutputPolicy::Raw, Some(dir.path().join("label_encoder.txt")));

        assert!(load_encoder(&config).unwrap().is_none());
    }

    #[test]
    fn label_policy_requires_encoder_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("label_encoder.txt");

        let err = load_encoder(&encoder_config(OutputPolicy::Label, Some(path.clone()))).unwrap_err();
        assert!(matches!(err, ModelError::NotFound(_)));

        std::fs::write(&path, TRAITS).unwrap();
        let encoder = load_encoder(&encoder_config(OutputPolicy::Label, Some(path)))
            .unwrap()
            .unwrap();
        assert_eq!(encoder.len(), 5);
    }

    #[test]
    fn unparsable_model_is_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("graphology_model.pb");
        std::fs::write(&model_path, b"\xff\xff\xff\xff not a graph").unwrap();

        let err = TfClassifier::load(&model_path, "x", "Identity").unwrap_err();
        assert!(matches!(err, ModelError::LoadFailure { .. }));
    }
}
