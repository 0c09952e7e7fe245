use std::{env, path::Path};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};

use crate::config::Settings;
use crate::error::ModelError;

async fn download_file(url: &str, path: &Path) -> Result<(), ModelError> {
    tracing::info!(url, path = %path.display(), "downloading artifact");
    let failed = |reason: String| ModelError::Download {
        url: url.to_string(),
        reason,
    };

    let mut header_map = HeaderMap::new();
    if let Ok(token) = env::var("GITHUB_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| failed("invalid GITHUB_TOKEN format".into()))?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(|e| failed(e.to_string()))?;

    if !response.status().is_success() {
        return Err(failed(format!("server answered {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| failed(e.to_string()))?;
    }
    tokio::fs::write(path, &bytes)
        .await
        .map_err(|e| failed(e.to_string()))?;

    tracing::info!(path = %path.display(), bytes = bytes.len(), "artifact downloaded");
    Ok(())
}

/// Fetches any missing artifact that has a download URL configured. Artifacts
/// without a URL are left for the loader to report as missing.
pub async fn ensure_artifacts_exist(settings: &Settings) -> Result<(), ModelError> {
    let artifacts = [
        (Some(&settings.model_path), settings.model_url.as_deref()),
        (
            settings.label_encoder_path.as_ref(),
            settings.label_encoder_url.as_deref(),
        ),
    ];

    for (path, url) in artifacts {
        if let (Some(path), Some(url)) = (path, url) {
            if !path.exists() {
                download_file(url, path).await?;
            }
        }
    }
    Ok(())
}
