//! Title metadata lookup for dump directories.
//!
//! The pipeline only needs two opaque strings per input: a display label and
//! a title id. [`ParamJson`] reads them from `sce_sys/param.json`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Label and title id for one input tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TitleInfo {
    pub label: String,
    pub title_id: String,
}

/// Source of [`TitleInfo`] for an input directory.
pub trait TitleMetadata {
    fn lookup(&self, input_dir: &Path) -> Result<TitleInfo>;
}

/// Reads `<input>/<metadata_dir>/param.json`.
#[derive(Debug, Clone)]
pub struct ParamJson {
    metadata_dir: String,
}

impl ParamJson {
    pub fn new(metadata_dir: impl Into<String>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParamFile {
    title_id: Option<String>,
    #[serde(default)]
    localized_parameters: Option<LocalizedParameters>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalizedParameters {
    default_language: Option<String>,
    #[serde(flatten)]
    languages: BTreeMap<String, serde_json::Value>,
}

impl LocalizedParameters {
    fn title_name(&self) -> Option<String> {
        let from = |lang: &str| {
            self.languages
                .get(lang)
                .and_then(|v| v.get("titleName"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        self.default_language
            .as_deref()
            .and_then(from)
            .or_else(|| from("en-US"))
    }
}

impl TitleMetadata for ParamJson {
    /// Missing manifest: empty label, directory name as title id.
    fn lookup(&self, input_dir: &Path) -> Result<TitleInfo> {
        let fallback_id = input_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let path = input_dir.join(&self.metadata_dir).join("param.json");
        if !path.is_file() {
            return Ok(TitleInfo {
                label: String::new(),
                title_id: fallback_id,
            });
        }

        let bytes =
            fs::read(&path).with_context(|| format!("reading title manifest '{}'", path.display()))?;
        let parsed: ParamFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing title manifest '{}'", path.display()))?;

        Ok(TitleInfo {
            label: parsed
                .localized_parameters
                .as_ref()
                .and_then(LocalizedParameters::title_name)
                .unwrap_or_default(),
            title_id: parsed
                .title_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(fallback_id),
        })
    }
}
