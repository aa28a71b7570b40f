//! Block size optimization.
//!
//! Probes the builder once per candidate block size in a bounded "test" run,
//! reads back the image size it reports and keeps the smallest. Candidates
//! are probed strictly one after another; the builder can be memory hungry.
//!
//! # Policy
//!
//! - Fragment size is always `block_size / 8`.
//! - Inputs above [`LARGE_INPUT_THRESHOLD`] skip block sizes up to
//!   [`SMALL_BLOCK_LIMIT`]: the builder tends to run out of memory building
//!   the inode table for huge trees with small blocks.
//! - Ties keep the smaller block size (first probed).
//! - When no probe yields a size, [`fallback`] picks 65536/8192 with the input
//!   size as the estimate.

pub mod size_report;

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::builder::probe_command;
use crate::cancel::CancelToken;
use crate::config::ConverterConfig;
use crate::error::{ConvertError, ConvertResult};
use crate::events::{EventSink, Stage};

use size_report::parse_reported_size;

/// Candidate block sizes, probed in this order.
pub const BLOCK_SIZES: [u32; 5] = [4096, 8192, 16384, 32768, 65536];

/// Fragment size divisor.
pub const FRAGMENT_DIVISOR: u32 = 8;

/// Inputs larger than this (30 GiB) skip small block sizes.
pub const LARGE_INPUT_THRESHOLD: u64 = 30 * 1024 * 1024 * 1024;

/// Largest block size excluded for large inputs.
pub const SMALL_BLOCK_LIMIT: u32 = 8192;

/// Block size used when no probe could be parsed.
pub const FALLBACK_BLOCK_SIZE: u32 = 65536;

/// Percent window covered by the optimizing stage.
const PERCENT_START: u8 = 5;
const PERCENT_SPAN: u8 = 50;

/// One (block size, fragment size) pair under consideration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeCandidate {
    pub block_size: u32,
}

impl BlockSizeCandidate {
    pub fn new(block_size: u32) -> Self {
        Self { block_size }
    }

    pub fn fragment_size(&self) -> u32 {
        self.block_size / FRAGMENT_DIVISOR
    }
}

/// Outcome of the optimization search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizationResult {
    pub block_size: u32,
    pub fragment_size: u32,
    /// Image size in bytes reported by the winning probe, or the input size
    /// when `estimated`.
    pub image_size: u64,
    /// True when no probe could be parsed and the safe default was used.
    pub estimated: bool,
}

impl OptimizationResult {
    fn from_probe(candidate: BlockSizeCandidate, image_size: u64) -> Self {
        Self {
            block_size: candidate.block_size,
            fragment_size: candidate.fragment_size(),
            image_size,
            estimated: false,
        }
    }
}

/// Candidates to probe for an input of `input_size` bytes.
pub fn candidates_for(input_size: u64) -> Vec<BlockSizeCandidate> {
    BLOCK_SIZES
        .iter()
        .copied()
        .filter(|&block| input_size <= LARGE_INPUT_THRESHOLD || block > SMALL_BLOCK_LIMIT)
        .map(BlockSizeCandidate::new)
        .collect()
}

/// Pick the candidate with the smallest reported size.
///
/// Unparsed probes (`None`) are ignored. On a tie the earlier entry wins.
pub fn select_best(probes: &[(BlockSizeCandidate, Option<u64>)]) -> Option<OptimizationResult> {
    let mut best: Option<OptimizationResult> = None;
    for (candidate, size) in probes {
        let Some(size) = *size else {
            continue;
        };
        if best.map_or(true, |b| size < b.image_size) {
            best = Some(OptimizationResult::from_probe(*candidate, size));
        }
    }
    best
}

/// Safe default used when no candidate could be evaluated.
pub fn fallback(input_size: u64) -> OptimizationResult {
    let candidate = BlockSizeCandidate::new(FALLBACK_BLOCK_SIZE);
    OptimizationResult {
        block_size: candidate.block_size,
        fragment_size: candidate.fragment_size(),
        image_size: input_size,
        estimated: true,
    }
}

/// Total size in bytes of all regular files under `root`.
pub fn measure_input_size(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("walking input tree '{}'", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("reading metadata for '{}'", entry.path().display()))?;
        total = total.saturating_add(metadata.len());
    }
    Ok(total)
}

/// Runs the probe sequence for one input tree.
pub struct BlockSizeOptimizer<'a> {
    config: &'a ConverterConfig,
    events: &'a EventSink,
}

impl<'a> BlockSizeOptimizer<'a> {
    pub fn new(config: &'a ConverterConfig, events: &'a EventSink) -> Self {
        Self { config, events }
    }

    /// Choose the block/fragment size that minimizes the image size.
    ///
    /// Only cancellation is an error; everything else degrades to the
    /// fallback.
    pub fn optimize(&self, input: &Path, cancel: &CancelToken) -> ConvertResult<OptimizationResult> {
        cancel.check()?;
        self.events.progress(Stage::Scanning, "Measuring input size", 0);
        let input_size = match measure_input_size(input) {
            Ok(size) => {
                info!("input '{}' holds {} bytes", input.display(), size);
                size
            }
            Err(e) => {
                warn!("could not measure input size, skipping size policy: {:#}", e);
                0
            }
        };
        self.events.log(format!("Input size: {} bytes", input_size));

        let candidates = candidates_for(input_size);
        if candidates.len() < BLOCK_SIZES.len() {
            self.events.log(format!(
                "Input exceeds {} bytes; skipping block sizes <= {}",
                LARGE_INPUT_THRESHOLD, SMALL_BLOCK_LIMIT
            ));
        }

        let probe_path = self.probe_path();
        let probes = self.probe_all(input, &candidates, &probe_path, cancel);
        remove_probe(&probe_path);
        let probes = probes?;

        match select_best(&probes) {
            Some(best) => {
                info!(
                    "selected block size {} (fragment {}), image {} bytes",
                    best.block_size, best.fragment_size, best.image_size
                );
                self.events.log(format!(
                    "Best block size: {} (fragment {}), image {} bytes",
                    best.block_size, best.fragment_size, best.image_size
                ));
                Ok(best)
            }
            None => {
                warn!("no probe reported a parseable size; using fallback geometry");
                let result = fallback(input_size);
                self.events.log(format!(
                    "Could not determine optimal block size; using {} (fragment {})",
                    result.block_size, result.fragment_size
                ));
                Ok(result)
            }
        }
    }

    fn probe_all(
        &self,
        input: &Path,
        candidates: &[BlockSizeCandidate],
        probe_path: &Path,
        cancel: &CancelToken,
    ) -> ConvertResult<Vec<(BlockSizeCandidate, Option<u64>)>> {
        let mut probes = Vec::with_capacity(candidates.len());
        let total = candidates.len().max(1);
        for (index, candidate) in candidates.iter().enumerate() {
            cancel.check()?;
            let percent = PERCENT_START + (index * usize::from(PERCENT_SPAN) / total) as u8;
            self.events.progress(
                Stage::Optimizing,
                format!(
                    "Testing block size {} ({}/{})",
                    candidate.block_size,
                    index + 1,
                    candidates.len()
                ),
                percent,
            );
            let size = self.probe(input, *candidate, probe_path, cancel)?;
            probes.push((*candidate, size));
        }
        Ok(probes)
    }

    /// Probe one candidate. Failures other than cancellation become `None`.
    fn probe(
        &self,
        input: &Path,
        candidate: BlockSizeCandidate,
        probe_path: &Path,
        cancel: &CancelToken,
    ) -> ConvertResult<Option<u64>> {
        if let Err(e) = reset_probe(probe_path) {
            warn!("could not reset probe file '{}': {:#}", probe_path.display(), e);
        }

        let cmd = probe_command(
            &self.config.builder,
            u64::from(candidate.block_size),
            candidate.block_size,
            candidate.fragment_size(),
            probe_path,
            input,
        );
        let output = match cmd.run(cancel) {
            Ok(output) => output,
            Err(ConvertError::Cancelled) => return Err(ConvertError::Cancelled),
            Err(e) => {
                warn!("probe for block size {} failed: {}", candidate.block_size, e);
                self.events
                    .log(format!("Block size {}: probe failed: {}", candidate.block_size, e));
                return Ok(None);
            }
        };

        match parse_reported_size(&output.output) {
            Some(size) => {
                debug!(
                    "block size {} -> {} bytes (exit {})",
                    candidate.block_size, size, output.exit_code
                );
                self.events
                    .log(format!("Block size {}: {} bytes", candidate.block_size, size));
                Ok(Some(size))
            }
            None => {
                warn!(
                    "could not parse image size for block size {} (exit {})",
                    candidate.block_size, output.exit_code
                );
                self.events.log(format!(
                    "Block size {}: could not parse image size",
                    candidate.block_size
                ));
                Ok(None)
            }
        }
    }

    fn probe_path(&self) -> PathBuf {
        if let Err(e) = fs::create_dir_all(&self.config.cache_dir) {
            warn!(
                "could not create cache directory '{}': {}",
                self.config.cache_dir.display(),
                e
            );
        }
        self.config
            .cache_dir
            .join(format!("probe-{}.img", std::process::id()))
    }
}

/// Delete and recreate an empty probe file.
fn reset_probe(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("removing probe file '{}'", path.display()))?;
    }
    File::create(path).with_context(|| format!("creating probe file '{}'", path.display()))?;
    Ok(())
}

fn remove_probe(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("could not remove probe file '{}': {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuilderTool;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_fragment_is_eighth_of_block() {
        for block in BLOCK_SIZES {
            assert_eq!(BlockSizeCandidate::new(block).fragment_size() * 8, block);
        }
    }

    #[test]
    fn test_small_input_probes_all_sizes() {
        let blocks: Vec<u32> = candidates_for(GIB).iter().map(|c| c.block_size).collect();
        assert_eq!(blocks, BLOCK_SIZES.to_vec());
        assert_eq!(candidates_for(LARGE_INPUT_THRESHOLD).len(), 5);
    }

    #[test]
    fn test_large_input_skips_small_blocks() {
        let blocks: Vec<u32> = candidates_for(LARGE_INPUT_THRESHOLD + 1)
            .iter()
            .map(|c| c.block_size)
            .collect();
        assert_eq!(blocks, vec![16384, 32768, 65536]);
    }

    #[test]
    fn test_select_minimum() {
        let sizes = [1.10, 1.05, 1.02, 1.04, 1.08];
        let probes: Vec<_> = BLOCK_SIZES
            .iter()
            .zip(sizes)
            .map(|(&b, s)| (BlockSizeCandidate::new(b), Some((s * GIB as f64) as u64)))
            .collect();
        let best = select_best(&probes).unwrap();
        assert_eq!(best.block_size, 16384);
        assert_eq!(best.fragment_size, 2048);
        assert!(!best.estimated);
    }

    #[test]
    fn test_select_tie_keeps_first() {
        let probes = vec![
            (BlockSizeCandidate::new(8192), None),
            (BlockSizeCandidate::new(16384), Some(500)),
            (BlockSizeCandidate::new(32768), Some(500)),
            (BlockSizeCandidate::new(65536), Some(700)),
        ];
        assert_eq!(select_best(&probes).unwrap().block_size, 16384);
    }

    #[test]
    fn test_select_none_parsed() {
        let probes = vec![
            (BlockSizeCandidate::new(4096), None),
            (BlockSizeCandidate::new(8192), None),
        ];
        assert!(select_best(&probes).is_none());
        let fb = fallback(123);
        assert_eq!((fb.block_size, fb.fragment_size), (65536, 8192));
        assert_eq!(fb.image_size, 123);
        assert!(fb.estimated);
    }

    #[test]
    fn test_measure_input_size() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sce_sys")).unwrap();
        fs::write(tmp.path().join("eboot.bin"), vec![0u8; 1000]).unwrap();
        fs::write(tmp.path().join("sce_sys/param.json"), vec![0u8; 24]).unwrap();
        assert_eq!(measure_input_size(tmp.path()).unwrap(), 1024);
    }

    #[test]
    fn test_measure_missing_tree_fails() {
        assert!(measure_input_size(Path::new("/nonexistent_tree_12345")).is_err());
    }

    #[cfg(unix)]
    fn fake_builder_config(tmp: &TempDir, script: &str) -> ConverterConfig {
        let script_path = tmp.path().join("fake-builder.sh");
        fs::write(&script_path, script).unwrap();
        ConverterConfig {
            builder: BuilderTool {
                program: PathBuf::from("sh"),
                leading_args: vec![script_path.display().to_string()],
                filesystem: "ufs2".to_string(),
            },
            cache_dir: tmp.path().join("cache"),
            ..ConverterConfig::default()
        }
    }

    #[cfg(unix)]
    fn input_tree(tmp: &TempDir) -> PathBuf {
        let input = tmp.path().join("PPSA01234");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("eboot.bin"), b"data").unwrap();
        input
    }

    /// Fake builder: `$6` is the `-b` value in test mode
    /// (`makefs --test --size-limit N -b B ...`).
    #[cfg(unix)]
    const SIZE_BY_BLOCK: &str = r#"
case "$6" in
  4096)  echo "Image size: 1,181,116,006 bytes" ;;
  8192)  echo "Image size: 1,127,428,915 bytes" ;;
  16384) echo "Image size: 1,095,216,660 bytes" ;;
  32768) echo "Image size: 1,116,691,497 bytes" ;;
  65536) echo "Image size: 1,159,641,169 bytes" ;;
esac
echo "error: image exceeds size limit" 1>&2
exit 1
"#;

    #[cfg(unix)]
    #[test]
    fn test_optimize_picks_smallest_probe() {
        let tmp = TempDir::new().unwrap();
        let config = fake_builder_config(&tmp, SIZE_BY_BLOCK);
        let input = input_tree(&tmp);
        let events = EventSink::discard();

        let result = BlockSizeOptimizer::new(&config, &events)
            .optimize(&input, &CancelToken::new())
            .unwrap();
        assert_eq!(result.block_size, 16384);
        assert_eq!(result.fragment_size, 2048);
        assert_eq!(result.image_size, 1_095_216_660);
        assert!(!result.estimated);
        assert!(!config
            .cache_dir
            .join(format!("probe-{}.img", std::process::id()))
            .exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_optimize_falls_back_when_unparseable() {
        let tmp = TempDir::new().unwrap();
        let config = fake_builder_config(&tmp, "echo 'something changed'\nexit 1\n");
        let input = input_tree(&tmp);
        let events = EventSink::discard();

        let result = BlockSizeOptimizer::new(&config, &events)
            .optimize(&input, &CancelToken::new())
            .unwrap();
        assert_eq!((result.block_size, result.fragment_size), (65536, 8192));
        assert_eq!(result.image_size, 4);
        assert!(result.estimated);
    }

    #[cfg(unix)]
    #[test]
    fn test_optimize_missing_builder_falls_back() {
        let tmp = TempDir::new().unwrap();
        let mut config = fake_builder_config(&tmp, "");
        config.builder.program = PathBuf::from("/nonexistent_builder_12345");
        let input = input_tree(&tmp);
        let events = EventSink::discard();

        let result = BlockSizeOptimizer::new(&config, &events)
            .optimize(&input, &CancelToken::new())
            .unwrap();
        assert!(result.estimated);
    }

    #[cfg(unix)]
    #[test]
    fn test_optimize_cancelled() {
        let tmp = TempDir::new().unwrap();
        let config = fake_builder_config(&tmp, SIZE_BY_BLOCK);
        let input = input_tree(&tmp);
        let events = EventSink::discard();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = BlockSizeOptimizer::new(&config, &events)
            .optimize(&input, &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
