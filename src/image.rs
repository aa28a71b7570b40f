//! The real (unbounded) image build.
//!
//! Runs the builder once with the optimizer's geometry, translating its
//! output into progress while a [`PulseTicker`] covers quiet phases. An
//! image only counts as built when the builder exits 0 **and** the output
//! file exists: some builder versions exit cleanly without writing anything.
//!
//! Whatever goes wrong, a partial output file is removed before returning.

use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::builder::build_command;
use crate::cancel::CancelToken;
use crate::config::ConverterConfig;
use crate::error::{ConvertError, ConvertResult};
use crate::events::{EventSink, Stage};
use crate::progress::{translate, PulseTicker, StructuredClock};
use crate::ConversionRequest;

/// Attempts made to delete a partial output file.
pub const CLEANUP_ATTEMPTS: u32 = 3;

/// Delay between cleanup attempts; the killed builder may still hold the file.
pub const CLEANUP_DELAY: Duration = Duration::from_millis(200);

/// Percent reported when the build starts.
const BUILD_START_PERCENT: u8 = 60;

/// A successfully built image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltImage {
    pub file_size: u64,
    pub block_size: u32,
    pub fragment_size: u32,
}

/// Drives the real build for one request.
pub struct ImageBuilder<'a> {
    config: &'a ConverterConfig,
    events: &'a EventSink,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(config: &'a ConverterConfig, events: &'a EventSink) -> Self {
        Self { config, events }
    }

    /// Build `request.output_path` from `request.input_dir`.
    pub fn build(
        &self,
        request: &ConversionRequest,
        block_size: u32,
        fragment_size: u32,
        cancel: &CancelToken,
    ) -> ConvertResult<BuiltImage> {
        let output = request.output_path.as_path();
        remove_stale_output(output);

        let result = self.run_builder(request, block_size, fragment_size, cancel);
        if result.is_err() {
            cleanup_partial_output(output);
        }
        result
    }

    fn run_builder(
        &self,
        request: &ConversionRequest,
        block_size: u32,
        fragment_size: u32,
        cancel: &CancelToken,
    ) -> ConvertResult<BuiltImage> {
        cancel.check()?;
        let output = request.output_path.as_path();
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        self.events.progress(
            Stage::Creating,
            format!("Creating image (block {}, fragment {})", block_size, fragment_size),
            BUILD_START_PERCENT,
        );
        info!(
            "building '{}' from '{}' with block {} / fragment {}",
            output.display(),
            request.input_dir.display(),
            block_size,
            fragment_size
        );

        let cmd = build_command(
            &self.config.builder,
            block_size,
            fragment_size,
            &request.label,
            output,
            &request.input_dir,
        );
        self.events.log(format!("Running: {}", cmd.display()));

        let clock = StructuredClock::new();
        let ticker = PulseTicker::start(self.events.clone(), clock.clone(), cancel.clone());
        let events = self.events;
        let run = cmd.run_streaming(
            |line| {
                events.log(line);
                if let Some(update) = translate(line) {
                    clock.mark();
                    events.progress(update.stage, update.detail, update.percent);
                }
            },
            cancel,
        );
        ticker.stop();
        run?;

        if !output.is_file() {
            return Err(ConvertError::BuilderOutputMissing {
                path: output.to_path_buf(),
            });
        }
        let file_size = fs::metadata(output)?.len();
        info!("image created: {} bytes", file_size);

        Ok(BuiltImage {
            file_size,
            block_size,
            fragment_size,
        })
    }
}

/// Remove an output left over from a previous run. Failure is only logged;
/// the builder may still be able to overwrite it.
fn remove_stale_output(output: &Path) {
    if !output.exists() {
        return;
    }
    if let Err(e) = fs::remove_file(output) {
        warn!(
            "could not remove existing output '{}', builder will try to overwrite it: {}",
            output.display(),
            e
        );
    }
}

/// Delete a partial output, retrying while the OS releases the file.
///
/// Returns true when the file is gone.
pub fn cleanup_partial_output(output: &Path) -> bool {
    for attempt in 1..=CLEANUP_ATTEMPTS {
        if !output.exists() {
            return true;
        }
        match fs::remove_file(output) {
            Ok(()) => return true,
            Err(e) => {
                warn!(
                    "attempt {}/{} to remove partial output '{}' failed: {}",
                    attempt,
                    CLEANUP_ATTEMPTS,
                    output.display(),
                    e
                );
                if attempt < CLEANUP_ATTEMPTS {
                    std::thread::sleep(CLEANUP_DELAY);
                }
            }
        }
    }
    !output.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_missing_file_is_ok() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(cleanup_partial_output(&tmp.path().join("absent.img")));
    }

    #[test]
    fn test_cleanup_removes_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("partial.img");
        fs::write(&path, b"half an image").unwrap();
        assert!(cleanup_partial_output(&path));
        assert!(!path.exists());
    }

    #[cfg(unix)]
    mod with_fake_builder {
        use super::super::*;
        use crate::config::BuilderTool;
        use crate::events::ConversionEvent;
        use std::path::PathBuf;
        use std::sync::mpsc;
        use std::time::Instant;
        use tempfile::TempDir;

        fn setup(script: &str) -> (TempDir, ConverterConfig, ConversionRequest) {
            let tmp = TempDir::new().unwrap();
            let script_path = tmp.path().join("fake-builder.sh");
            fs::write(&script_path, script).unwrap();
            let input = tmp.path().join("input");
            fs::create_dir_all(&input).unwrap();
            fs::write(input.join("eboot.bin"), b"game").unwrap();
            let config = ConverterConfig {
                builder: BuilderTool {
                    program: PathBuf::from("sh"),
                    leading_args: vec![script_path.display().to_string()],
                    filesystem: "ufs2".to_string(),
                },
                cache_dir: tmp.path().join("cache"),
                ..ConverterConfig::default()
            };
            let request = ConversionRequest {
                input_dir: input,
                output_path: tmp.path().join("out/game.img"),
                label: "Game".to_string(),
                title_id: "PPSA01234".to_string(),
                compat_mode: false,
            };
            (tmp, config, request)
        }

        /// Build mode args: `makefs -b B -f F -t fs -L label OUTPUT INPUT`.
        const WRITES_OUTPUT: &str = r#"
echo "Writing cylinder groups... 100%"
echo "Adding files to image...  50% (1/2 files)"
printf 'IMAGE' > "${10}"
echo "Adding files to image... 100% (2/2 files)"
"#;

        #[test]
        fn test_build_success() {
            let (_tmp, config, request) = setup(WRITES_OUTPUT);
            let (tx, rx) = mpsc::channel();
            let events = EventSink::new(tx);

            let built = ImageBuilder::new(&config, &events)
                .build(&request, 16384, 2048, &CancelToken::new())
                .unwrap();
            drop(events);

            assert_eq!(built.file_size, 5);
            assert_eq!((built.block_size, built.fragment_size), (16384, 2048));
            let percents: Vec<u8> = rx
                .iter()
                .filter_map(|e| match e {
                    ConversionEvent::Progress(p) => Some(p.percent),
                    ConversionEvent::Log(_) => None,
                })
                .collect();
            assert!(percents.contains(&65));
            assert!(percents.contains(&81));
            assert!(percents.contains(&98));
        }

        #[test]
        fn test_exit_zero_without_output_is_error() {
            let (_tmp, config, request) = setup("echo done\nexit 0\n");
            let events = EventSink::discard();
            let err = ImageBuilder::new(&config, &events)
                .build(&request, 65536, 8192, &CancelToken::new())
                .unwrap_err();
            assert!(matches!(err, ConvertError::BuilderOutputMissing { .. }));
            assert!(err.to_string().contains("output file was not created"));
        }

        #[test]
        fn test_nonzero_exit_removes_partial_output() {
            let (_tmp, config, request) =
                setup("printf 'PART' > \"${10}\"\necho 'disk full' 1>&2\nexit 5\n");
            let events = EventSink::discard();
            let err = ImageBuilder::new(&config, &events)
                .build(&request, 65536, 8192, &CancelToken::new())
                .unwrap_err();
            match err {
                ConvertError::BuilderExitNonzero { code, output } => {
                    assert_eq!(code, 5);
                    assert!(output.contains("disk full"));
                }
                other => panic!("unexpected error: {other}"),
            }
            assert!(!request.output_path.exists());
        }

        #[test]
        fn test_stale_output_is_replaced() {
            let (_tmp, config, request) = setup(WRITES_OUTPUT);
            fs::create_dir_all(request.output_path.parent().unwrap()).unwrap();
            fs::write(&request.output_path, b"old image from a previous run").unwrap();
            let events = EventSink::discard();
            let built = ImageBuilder::new(&config, &events)
                .build(&request, 16384, 2048, &CancelToken::new())
                .unwrap();
            assert_eq!(built.file_size, 5);
        }

        #[test]
        fn test_cancel_removes_output() {
            let (_tmp, config, request) = setup("printf 'PART' > \"${10}\"\nsleep 30\n");
            let events = EventSink::discard();
            let cancel = CancelToken::new();
            let trigger = cancel.clone();
            let output = request.output_path.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                while !output.exists() && start.elapsed() < Duration::from_secs(5) {
                    std::thread::sleep(Duration::from_millis(20));
                }
                trigger.cancel();
            });

            let err = ImageBuilder::new(&config, &events)
                .build(&request, 65536, 8192, &cancel)
                .unwrap_err();
            assert!(err.is_cancelled());
            assert!(!request.output_path.exists());
        }
    }
}
