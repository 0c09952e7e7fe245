use std::path::Path;

use crate::error::ModelError;

/// Maps class indices produced by the model to their trait names.
#[derive(Debug, Clone)]
pub struct LabelEncoder {
    labels: Vec<String>,
}

impl LabelEncoder {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| ModelError::LoadFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_lines(&contents).ok_or_else(|| ModelError::LoadFailure {
            path: path.to_path_buf(),
            reason: "label encoder contains no labels".into(),
        })
    }

    /// One label per line; trailing blank lines are dropped. Returns `None`
    /// when no label remains.
    pub fn from_lines(contents: &str) -> Option<Self> {
        let mut labels: Vec<String> = contents
            .lines()
            .map(|line| line.trim().to_string())
            .collect();
        while labels.last().is_some_and(|l| l.is_empty()) {
            labels.pop();
        }

        if labels.is_empty() {
            None
        } else {
            Some(LabelEncoder { labels })
        }
    }

    pub fn decode(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[cfg(test)]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}
