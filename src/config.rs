//! Converter configuration.
//!
//! Loaded once by the caller (from TOML or defaults) and handed to the
//! pipeline explicitly. Nothing below this layer reads process-wide state.
//!
//! ```toml
//! [builder]
//! program = "UFS2Tool"
//! leading_args = []
//! filesystem = "ufs2"
//!
//! [paths]
//! cache_dir = "/home/me/.cache/ffpkg-builder"
//!
//! [trailer]
//! metadata_dir = "sce_sys"
//! extensions = ["ffpkg"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default builder executable name, resolved on `PATH` when not absolute.
pub const DEFAULT_BUILDER_PROGRAM: &str = "UFS2Tool";

/// Default filesystem type passed to the builder.
pub const DEFAULT_FILESYSTEM: &str = "ufs2";

/// Metadata subdirectory whose files become trailer entries.
pub const DEFAULT_METADATA_DIR: &str = "sce_sys";

const CACHE_SUBDIR: &str = "ffpkg-builder";

/// How to launch the external builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderTool {
    /// Program to execute (the builder itself, or a launcher such as `wine`).
    pub program: PathBuf,
    /// Arguments placed before every builder command (e.g. the real builder
    /// path when `program` is a launcher).
    pub leading_args: Vec<String>,
    /// Filesystem type option (`-t`).
    pub filesystem: String,
}

/// Fully resolved configuration for conversion runs.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub builder: BuilderTool,
    /// Writable base directory for disposable probe images.
    pub cache_dir: PathBuf,
    /// Name of the metadata subdirectory inside an input tree.
    pub metadata_dir: String,
    /// Output extensions (without dot, lowercase) that carry a trailer.
    pub trailer_extensions: Vec<String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            builder: BuilderTool {
                program: PathBuf::from(DEFAULT_BUILDER_PROGRAM),
                leading_args: Vec::new(),
                filesystem: DEFAULT_FILESYSTEM.to_string(),
            },
            cache_dir: default_cache_dir(),
            metadata_dir: DEFAULT_METADATA_DIR.to_string(),
            trailer_extensions: vec!["ffpkg".to_string()],
        }
    }
}

impl ConverterConfig {
    /// Whether an output path should receive the compatibility trailer.
    pub fn expects_trailer(&self, output: &Path) -> bool {
        output
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.trailer_extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }

    /// Resolve a bare builder program name against `PATH`.
    ///
    /// Absolute or relative paths with a directory component are kept as-is.
    pub fn resolve_builder(&mut self) -> Result<()> {
        let program = &self.builder.program;
        if program.components().count() > 1 || program.is_absolute() {
            if !program.exists() {
                bail!("builder executable not found: {}", program.display());
            }
            return Ok(());
        }
        let resolved = which::which(program).with_context(|| {
            format!(
                "builder '{}' not found on PATH; set [builder] program in the config",
                program.display()
            )
        })?;
        self.builder.program = resolved;
        Ok(())
    }
}

/// Default cache directory for probe files.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CACHE_SUBDIR)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    #[serde(default)]
    builder: BuilderToml,
    #[serde(default)]
    paths: PathsToml,
    #[serde(default)]
    trailer: TrailerToml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuilderToml {
    program: Option<PathBuf>,
    leading_args: Option<Vec<String>>,
    filesystem: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsToml {
    cache_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrailerToml {
    metadata_dir: Option<String>,
    extensions: Option<Vec<String>>,
}

/// Parse configuration from TOML text, filling unset fields with defaults.
pub fn parse_config(text: &str) -> Result<ConverterConfig> {
    let parsed: ConfigToml = toml::from_str(text).context("parsing converter config")?;
    let mut config = ConverterConfig::default();

    if let Some(program) = parsed.builder.program {
        config.builder.program = program;
    }
    if let Some(args) = parsed.builder.leading_args {
        config.builder.leading_args = args;
    }
    if let Some(fs_type) = parsed.builder.filesystem {
        let fs_type = fs_type.trim().to_string();
        if fs_type.is_empty() {
            bail!("invalid config: [builder] filesystem must not be empty");
        }
        config.builder.filesystem = fs_type;
    }
    if let Some(cache_dir) = parsed.paths.cache_dir {
        config.cache_dir = cache_dir;
    }
    if let Some(metadata_dir) = parsed.trailer.metadata_dir {
        if metadata_dir.is_empty() || metadata_dir.contains(|c| c == '/' || c == '\\') {
            bail!(
                "invalid config: [trailer] metadata_dir must be a single directory name, got '{}'",
                metadata_dir
            );
        }
        config.metadata_dir = metadata_dir;
    }
    if let Some(extensions) = parsed.trailer.extensions {
        config.trailer_extensions = extensions
            .into_iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
    }

    Ok(config)
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ConverterConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading converter config '{}'", path.display()))?;
    parse_config(&text).with_context(|| format!("loading converter config '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.builder.program, PathBuf::from(DEFAULT_BUILDER_PROGRAM));
        assert_eq!(config.builder.filesystem, "ufs2");
        assert_eq!(config.metadata_dir, "sce_sys");
        assert_eq!(config.trailer_extensions, vec!["ffpkg".to_string()]);
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
            [builder]
            program = "/usr/bin/wine"
            leading_args = ["/opt/tools/UFS2Tool.exe"]
            filesystem = "ufs2"

            [paths]
            cache_dir = "/var/cache/ffpkg"

            [trailer]
            metadata_dir = "meta"
            extensions = [".FFPKG", "img"]
            "#,
        )
        .unwrap();
        assert_eq!(config.builder.program, PathBuf::from("/usr/bin/wine"));
        assert_eq!(config.builder.leading_args, vec!["/opt/tools/UFS2Tool.exe"]);
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/ffpkg"));
        assert_eq!(config.metadata_dir, "meta");
        assert_eq!(config.trailer_extensions, vec!["ffpkg", "img"]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(parse_config("[builder]\nprogramm = \"x\"\n").is_err());
    }

    #[test]
    fn test_metadata_dir_must_be_single_component() {
        let err = parse_config("[trailer]\nmetadata_dir = \"a/b\"\n").unwrap_err();
        assert!(err.to_string().contains("single directory name"));
    }

    #[test]
    fn test_expects_trailer_by_extension() {
        let config = ConverterConfig::default();
        assert!(config.expects_trailer(Path::new("/out/game.ffpkg")));
        assert!(config.expects_trailer(Path::new("/out/game.FFPKG")));
        assert!(!config.expects_trailer(Path::new("/out/game.img")));
        assert!(!config.expects_trailer(Path::new("/out/game")));
    }

    #[test]
    fn test_resolve_missing_absolute_builder() {
        let mut config = ConverterConfig::default();
        config.builder.program = PathBuf::from("/nonexistent_dir_12345/UFS2Tool");
        let err = config.resolve_builder().unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_resolve_bare_name_on_path() {
        let mut config = ConverterConfig::default();
        config.builder.program = PathBuf::from("sh");
        config.resolve_builder().unwrap();
        assert!(config.builder.program.is_absolute());
    }
}
