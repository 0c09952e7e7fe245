use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::model::{ModelConfig, OutputPolicy};

const DEFAULT_MODEL_PATH: &str = "./model/graphology_model.pb";
const DEFAULT_LABEL_ENCODER_PATH: &str = "./model/label_encoder.txt";

/// Service settings read from the process environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub model_path: PathBuf,
    pub label_encoder_path: Option<PathBuf>,
    pub model_url: Option<String>,
    pub label_encoder_url: Option<String>,
    pub input_op: String,
    pub output_op: String,
    pub policy: OutputPolicy,
    pub body_limit_bytes: usize,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub public_base_url: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let body_limit_bytes = {
            let raw = var("BODY_LIMIT_MB").unwrap_or_else(|| "5".into());
            raw.parse::<usize>()
                .ok()
                .and_then(|mb| mb.checked_mul(1024 * 1024))
                .ok_or_else(|| ConfigError::Invalid {
                    name: "BODY_LIMIT_MB",
                    expected: "a valid integer of megabytes",
                    value: raw.clone(),
                })?
        };

        let port = {
            let raw = var("PORT").unwrap_or_else(|| "5020".into());
            raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                expected: "a valid number between 0 and 65535",
                value: raw.clone(),
            })?
        };

        let policy = match var("OUTPUT_POLICY").as_deref().map(str::to_ascii_lowercase) {
            None => OutputPolicy::Label,
            Some(p) if p == "label" => OutputPolicy::Label,
            Some(p) if p == "raw" => OutputPolicy::Raw,
            Some(p) => {
                return Err(ConfigError::Invalid {
                    name: "OUTPUT_POLICY",
                    expected: "'label' or 'raw'",
                    value: p,
                })
            }
        };

        // An explicitly empty LABEL_ENCODER_PATH turns the encoder off.
        let label_encoder_path = match lookup("LABEL_ENCODER_PATH") {
            Some(p) if p.trim().is_empty() => None,
            Some(p) => Some(PathBuf::from(p)),
            None => Some(PathBuf::from(DEFAULT_LABEL_ENCODER_PATH)),
        };

        Ok(Settings {
            model_path: var("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            label_encoder_path,
            model_url: var("MODEL_URL"),
            label_encoder_url: var("LABEL_ENCODER_URL"),
            input_op: var("MODEL_INPUT_OP").unwrap_or_else(|| "x".into()),
            output_op: var("MODEL_OUTPUT_OP").unwrap_or_else(|| "Identity".into()),
            policy,
            body_limit_bytes,
            port,
            storage_dir: var("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./uploads")),
            public_base_url: var("PUBLIC_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| format!("http://localhost:{port}/files")),
        })
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model_path: self.model_path.clone(),
            label_encoder_path: self.label_encoder_path.clone(),
            input_op: self.input_op.clone(),
            output_op: self.output_op.clone(),
            policy: self.policy,
        }
    }
}
