use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context, Result};
use ffpkg_builder::interrupt;
use ffpkg_builder::metadata::{ParamJson, TitleMetadata};
use ffpkg_builder::trailer::{append_trailer, read_trailer};
use ffpkg_builder::{
    load_config, BlockSizeOptimizer, CancelToken, ConversionEvent, ConversionPipeline,
    ConversionQueue, ConversionRequest, ConverterConfig, EventSink,
};
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "FFPKG_BUILDER_CONFIG";
const CONFIG_SUBDIR: &str = "ffpkg-builder";
const CONFIG_FILE: &str = "config.toml";
const OUTPUT_EXTENSION: &str = "ffpkg";

fn usage() -> &'static str {
    "Usage:\n  ffpkg-builder convert <input_dir> <output>\n  ffpkg-builder convert-all <dump_root> <output_dir>\n  ffpkg-builder optimize <input_dir>\n  ffpkg-builder trailer append <image> <source_dir> <title_id>\n  ffpkg-builder trailer inspect <image>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    interrupt::install().context("installing interrupt handlers")?;

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, input, output] if cmd == "convert" => convert(Path::new(input), Path::new(output)),
        [cmd, root, output_dir] if cmd == "convert-all" => {
            convert_all(Path::new(root), Path::new(output_dir))
        }
        [cmd, input] if cmd == "optimize" => optimize(Path::new(input)),
        [trailer, append, image, source, title_id] if trailer == "trailer" && append == "append" => {
            trailer_append(Path::new(image), Path::new(source), title_id)
        }
        [trailer, inspect, image] if trailer == "trailer" && inspect == "inspect" => {
            trailer_inspect(Path::new(image))
        }
        _ => bail!(usage()),
    }
}

/// `$FFPKG_BUILDER_CONFIG`, else the per-user config file, else defaults.
fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_SUBDIR).join(CONFIG_FILE))
        .filter(|path| path.is_file())
}

fn load() -> Result<ConverterConfig> {
    let config = match config_path() {
        Some(path) => load_config(&path)?,
        None => ConverterConfig::default(),
    };
    Ok(config)
}

fn load_with_builder() -> Result<ConverterConfig> {
    let mut config = load()?;
    config.resolve_builder()?;
    Ok(config)
}

/// A token cancelled by Ctrl-C / SIGTERM.
fn interruptible_token() -> CancelToken {
    let token = CancelToken::new();
    let target = token.clone();
    interrupt::on_interrupt(move || target.cancel());
    token
}

/// Print progress events as `[stage] pct% detail` until the sender closes.
fn spawn_renderer(rx: Receiver<ConversionEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            if let ConversionEvent::Progress(p) = event {
                if p.is_error {
                    eprintln!("[{}] {:>3}% {}", p.stage, p.percent, p.detail);
                } else {
                    println!("[{}] {:>3}% {}", p.stage, p.percent, p.detail);
                }
            }
        }
    })
}

fn convert(input: &Path, output: &Path) -> Result<()> {
    let config = load_with_builder()?;
    let info = ParamJson::new(config.metadata_dir.clone())
        .lookup(input)
        .with_context(|| format!("reading title metadata from '{}'", input.display()))?;

    let request = ConversionRequest {
        input_dir: input.to_path_buf(),
        output_path: output.to_path_buf(),
        label: info.label,
        title_id: info.title_id,
        compat_mode: config.expects_trailer(output),
    };

    let (tx, rx) = mpsc::channel();
    let renderer = spawn_renderer(rx);
    let cancel = interruptible_token();
    let result = ConversionPipeline::new(&config, EventSink::new(tx)).run(&request, &cancel);
    let _ = renderer.join();

    if result.cancelled {
        bail!("conversion of '{}' cancelled", input.display());
    }
    if !result.success {
        bail!("converting '{}': {}", input.display(), result.error);
    }
    println!(
        "{}: {} bytes (block {}, fragment {})",
        result.output_path.display(),
        result.file_size,
        result.block_size,
        result.fragment_size
    );
    Ok(())
}

fn convert_all(root: &Path, output_dir: &Path) -> Result<()> {
    let config = load_with_builder()?;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory '{}'", output_dir.display()))?;

    let mut inputs = Vec::new();
    for entry in
        fs::read_dir(root).with_context(|| format!("reading dump root '{}'", root.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            inputs.push(path);
        }
    }
    inputs.sort();
    if inputs.is_empty() {
        bail!("no dump directories found in '{}'", root.display());
    }

    let metadata = ParamJson::new(config.metadata_dir.clone());
    let mut requests = Vec::new();
    for input in inputs {
        let info = metadata
            .lookup(&input)
            .with_context(|| format!("reading title metadata from '{}'", input.display()))?;
        let output_path = output_dir.join(format!("{}.{}", info.title_id, OUTPUT_EXTENSION));
        requests.push(ConversionRequest {
            compat_mode: config.expects_trailer(&output_path),
            input_dir: input,
            output_path,
            label: info.label,
            title_id: info.title_id,
        });
    }

    let (tx, rx) = mpsc::channel();
    let renderer = spawn_renderer(rx);
    let mut queue = ConversionQueue::new(config, EventSink::new(tx));
    let canceller = queue.canceller();
    interrupt::on_interrupt(move || canceller.cancel_all());
    for request in requests {
        println!("[queue] {} -> {}", request.input_dir.display(), request.output_path.display());
        queue.enqueue(request);
    }
    let results = queue.finish();
    let _ = renderer.join();

    let failed = results.iter().filter(|(_, r)| !r.success).count();
    for (id, result) in &results {
        if result.success {
            println!("#{id} ok     {} ({} bytes)", result.output_path.display(), result.file_size);
        } else {
            println!("#{id} failed {}: {}", result.output_path.display(), result.error);
        }
    }
    if failed > 0 {
        bail!("{} of {} conversions failed", failed, results.len());
    }
    Ok(())
}

fn optimize(input: &Path) -> Result<()> {
    let config = load_with_builder()?;
    let (tx, rx) = mpsc::channel();
    let renderer = spawn_renderer(rx);
    let events = EventSink::new(tx);
    let best = BlockSizeOptimizer::new(&config, &events)
        .optimize(input, &interruptible_token())
        .with_context(|| format!("optimizing block size for '{}'", input.display()));
    drop(events);
    let _ = renderer.join();
    let best = best?;

    println!(
        "block {} fragment {} image {} bytes{}",
        best.block_size,
        best.fragment_size,
        best.image_size,
        if best.estimated { " (fallback)" } else { "" }
    );
    Ok(())
}

fn trailer_append(image: &Path, source: &Path, title_id: &str) -> Result<()> {
    let config = load()?;
    let summary = append_trailer(image, title_id, source, &config.metadata_dir, &interruptible_token())
        .with_context(|| format!("appending trailer to '{}'", image.display()))?;
    match summary {
        Some(summary) => println!(
            "appended {} entries ({} bytes) to {}",
            summary.entries,
            summary.bytes,
            image.display()
        ),
        None => bail!(
            "'{}' has no '{}' directory",
            source.display(),
            config.metadata_dir
        ),
    }
    Ok(())
}

fn trailer_inspect(image: &Path) -> Result<()> {
    let trailer = read_trailer(image)
        .with_context(|| format!("reading trailer from '{}'", image.display()))?;
    let Some(trailer) = trailer else {
        bail!("'{}' has no ffpkg trailer", image.display());
    };

    println!("title:   {}", trailer.footer.title());
    println!("version: {}", trailer.footer.version);
    println!("image:   {} bytes", trailer.image_len);
    println!("entries: {}", trailer.footer.entry_count);
    for entry in &trailer.entries {
        println!("  {:>10}  {}", entry.data.len(), entry.path);
    }
    Ok(())
}
