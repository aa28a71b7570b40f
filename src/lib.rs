//! Convert extracted game dumps into optimized filesystem images.
//!
//! The heavy lifting is done by an external image builder (`makefs`-style
//! CLI). This crate supervises it:
//!
//! - **Block size optimizer** - probes each candidate geometry with a tiny
//!   size cap and picks the smallest reported image
//! - **Image builder** - runs the real build, translating builder output into
//!   progress and cleaning up partial files
//! - **Compatibility trailer** - appends metadata files plus a fixed footer
//!   to `.ffpkg` images, and reads it back
//! - **Queue** - runs conversions one at a time on a worker thread
//! - **Interrupts** - SIGINT/SIGTERM become cancellation, so the builder is
//!   killed and partial output removed
//!
//! # Architecture
//!
//! ```text
//! ConversionQueue ── one worker thread
//!     │
//!     └── ConversionPipeline::run(request, cancel) -> ConversionResult
//!             │
//!             ├── BlockSizeOptimizer   (Scanning 0-5%, Optimizing 5-55%)
//!             ├── ImageBuilder         (Creating 60-98%)
//!             │       └── Cmd::run_streaming + PulseTicker + translate()
//!             └── append_trailer       (Finalizing 98%, Complete 100%)
//!
//! EventSink ── one ordered channel of Progress / Log events
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ffpkg_builder::{CancelToken, ConversionPipeline, ConversionRequest, ConverterConfig, EventSink};
//!
//! let config = ConverterConfig::default();
//! let request = ConversionRequest {
//!     input_dir: "dumps/PPSA01342".into(),
//!     output_path: "out/PPSA01342.ffpkg".into(),
//!     label: "Astro Bot".into(),
//!     title_id: "PPSA01342".into(),
//!     compat_mode: true,
//! };
//! let result = ConversionPipeline::new(&config, EventSink::discard())
//!     .run(&request, &CancelToken::new());
//! assert!(result.success, "{}", result.error);
//! ```

pub mod builder;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod image;
pub mod interrupt;
pub mod metadata;
pub mod optimize;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod queue;
pub mod trailer;

pub use cancel::CancelToken;
pub use config::{load_config, parse_config, BuilderTool, ConverterConfig};
pub use error::{ConvertError, ConvertResult};
pub use events::{ConversionEvent, ConversionProgress, EventSink, Stage};
pub use image::{cleanup_partial_output, BuiltImage, ImageBuilder};
pub use metadata::{ParamJson, TitleInfo, TitleMetadata};
pub use optimize::{BlockSizeOptimizer, OptimizationResult};
pub use pipeline::{ConversionPipeline, ConversionRequest, ConversionResult};
pub use queue::{ConversionQueue, QueueCanceller, QueueTicket};
pub use trailer::{append_trailer, read_trailer, Trailer, TrailerEntry, TrailerSummary};
