//! One conversion: optimize, build, then optionally append the trailer.
//!
//! [`ConversionPipeline::run`] never returns an error. Every outcome is a
//! [`ConversionResult`]; failures additionally emit an `Error` progress event
//! carrying the same message, and cancellation a `Cancelled` event.

use std::fs;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::config::ConverterConfig;
use crate::error::{ConvertError, ConvertResult};
use crate::events::{EventSink, Stage};
use crate::image::{cleanup_partial_output, ImageBuilder};
use crate::optimize::BlockSizeOptimizer;
use crate::trailer::append_trailer;

const FINALIZE_PERCENT: u8 = 98;

/// Input for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    /// Dump directory to convert.
    pub input_dir: PathBuf,
    /// Image file to produce.
    pub output_path: PathBuf,
    /// Volume label; may be empty.
    pub label: String,
    /// Title id written into the trailer footer.
    pub title_id: String,
    /// Append the ffpkg trailer (for outputs whose extension expects it).
    pub compat_mode: bool,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResult {
    pub success: bool,
    pub cancelled: bool,
    pub output_path: PathBuf,
    /// Final file size including any trailer.
    pub file_size: u64,
    pub block_size: u32,
    pub fragment_size: u32,
    /// Empty on success.
    pub error: String,
}

impl ConversionResult {
    fn failed(request: &ConversionRequest, message: String) -> Self {
        Self {
            success: false,
            cancelled: false,
            output_path: request.output_path.clone(),
            file_size: 0,
            block_size: 0,
            fragment_size: 0,
            error: message,
        }
    }

    fn cancelled(request: &ConversionRequest) -> Self {
        Self {
            cancelled: true,
            ..Self::failed(request, ConvertError::Cancelled.to_string())
        }
    }
}

/// Runs conversions with a fixed configuration, reporting to one sink.
pub struct ConversionPipeline<'a> {
    config: &'a ConverterConfig,
    events: EventSink,
}

impl<'a> ConversionPipeline<'a> {
    pub fn new(config: &'a ConverterConfig, events: EventSink) -> Self {
        Self { config, events }
    }

    pub fn run(&self, request: &ConversionRequest, cancel: &CancelToken) -> ConversionResult {
        info!(
            "converting '{}' -> '{}'",
            request.input_dir.display(),
            request.output_path.display()
        );
        match self.execute(request, cancel) {
            Ok(result) => result,
            Err(ConvertError::Cancelled) => {
                warn!("conversion of '{}' cancelled", request.input_dir.display());
                self.events
                    .progress(Stage::Cancelled, "Conversion cancelled", 0);
                ConversionResult::cancelled(request)
            }
            Err(e) => {
                let message = e.to_string();
                error!("conversion of '{}' failed: {}", request.input_dir.display(), message);
                self.events.progress(Stage::Error, message.clone(), 0);
                ConversionResult::failed(request, message)
            }
        }
    }

    fn execute(
        &self,
        request: &ConversionRequest,
        cancel: &CancelToken,
    ) -> ConvertResult<ConversionResult> {
        cancel.check()?;
        if !request.input_dir.is_dir() {
            return Err(ConvertError::InputMissing {
                path: request.input_dir.clone(),
            });
        }

        let geometry =
            BlockSizeOptimizer::new(self.config, &self.events).optimize(&request.input_dir, cancel)?;

        let built = ImageBuilder::new(self.config, &self.events).build(
            request,
            geometry.block_size,
            geometry.fragment_size,
            cancel,
        )?;

        self.finalize(request, cancel)?;

        let file_size = fs::metadata(&request.output_path)?.len();
        self.events.progress(
            Stage::Complete,
            format!("Created {} ({} bytes)", request.output_path.display(), file_size),
            100,
        );
        info!("conversion complete: {} bytes", file_size);

        Ok(ConversionResult {
            success: true,
            cancelled: false,
            output_path: request.output_path.clone(),
            file_size,
            block_size: built.block_size,
            fragment_size: built.fragment_size,
            error: String::new(),
        })
    }

    /// Append the trailer when the request and output extension call for it.
    ///
    /// A trailer failure leaves the image in place; cancellation removes it.
    fn finalize(&self, request: &ConversionRequest, cancel: &CancelToken) -> ConvertResult<()> {
        if !request.compat_mode {
            return Ok(());
        }
        if !self.config.expects_trailer(&request.output_path) {
            self.events.log(format!(
                "Compatibility mode ignored: '{}' does not use a trailer extension",
                request.output_path.display()
            ));
            return Ok(());
        }

        self.events
            .progress(Stage::Finalizing, "Appending metadata trailer", FINALIZE_PERCENT);
        let appended = append_trailer(
            &request.output_path,
            &request.title_id,
            &request.input_dir,
            &self.config.metadata_dir,
            cancel,
        );
        match appended {
            Ok(Some(summary)) => {
                self.events.log(format!(
                    "Trailer: {} entries, {} bytes",
                    summary.entries, summary.bytes
                ));
                Ok(())
            }
            Ok(None) => {
                self.events.log(format!(
                    "No '{}' directory in input; trailer skipped",
                    self.config.metadata_dir
                ));
                Ok(())
            }
            Err(ConvertError::Cancelled) => {
                cleanup_partial_output(&request.output_path);
                Err(ConvertError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }
}
