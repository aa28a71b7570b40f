//! Command lines for the external image builder.
//!
//! The builder has two modes used here:
//!
//! - **test**: a bounded dry run capped at `--size-limit` bytes that reports
//!   the image size the real build would need (and usually exits nonzero
//!   because the cap is tiny).
//! - **build**: the real, unbounded build writing `output` from `source`.
//!
//! Both take `-b <block> -f <fragment> -t <filesystem>`.

use std::path::Path;

use crate::config::BuilderTool;
use crate::process::Cmd;

/// Builder subcommand that produces filesystem images.
pub const MAKEFS_SUBCOMMAND: &str = "makefs";

/// Build a probe ("test" mode) invocation.
pub fn probe_command(
    tool: &BuilderTool,
    size_limit: u64,
    block_size: u32,
    fragment_size: u32,
    probe_path: &Path,
    source_dir: &Path,
) -> Cmd {
    base_command(tool)
        .args(["--test", "--size-limit"])
        .arg(size_limit.to_string())
        .args(geometry_args(tool, block_size, fragment_size))
        .arg_path(probe_path)
        .arg_path(source_dir)
}

/// Build the real image build invocation.
///
/// An empty `label` omits the `-L` option.
pub fn build_command(
    tool: &BuilderTool,
    block_size: u32,
    fragment_size: u32,
    label: &str,
    output: &Path,
    source_dir: &Path,
) -> Cmd {
    let mut cmd = base_command(tool).args(geometry_args(tool, block_size, fragment_size));
    let label = label.trim();
    if !label.is_empty() {
        cmd = cmd.arg("-L").arg(label);
    }
    cmd.arg_path(output).arg_path(source_dir)
}

fn base_command(tool: &BuilderTool) -> Cmd {
    Cmd::new(&tool.program)
        .args(tool.leading_args.iter())
        .arg(MAKEFS_SUBCOMMAND)
}

fn geometry_args(tool: &BuilderTool, block_size: u32, fragment_size: u32) -> Vec<String> {
    vec![
        "-b".to_string(),
        block_size.to_string(),
        "-f".to_string(),
        fragment_size.to_string(),
        "-t".to_string(),
        tool.filesystem.clone(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tool() -> BuilderTool {
        BuilderTool {
            program: PathBuf::from("/usr/bin/wine"),
            leading_args: vec!["UFS2Tool.exe".to_string()],
            filesystem: "ufs2".to_string(),
        }
    }

    #[test]
    fn test_probe_command_line() {
        let cmd = probe_command(
            &tool(),
            16384,
            16384,
            2048,
            Path::new("/cache/probe.img"),
            Path::new("/dumps/PPSA01234"),
        );
        assert_eq!(
            cmd.display(),
            "/usr/bin/wine UFS2Tool.exe makefs --test --size-limit 16384 -b 16384 -f 2048 -t ufs2 /cache/probe.img /dumps/PPSA01234"
        );
    }

    #[test]
    fn test_build_command_with_label() {
        let cmd = build_command(
            &tool(),
            65536,
            8192,
            "Astro Bot",
            Path::new("/out/astro.ffpkg"),
            Path::new("/dumps/astro"),
        );
        let args: Vec<String> = cmd
            .arguments()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "UFS2Tool.exe",
                "makefs",
                "-b",
                "65536",
                "-f",
                "8192",
                "-t",
                "ufs2",
                "-L",
                "Astro Bot",
                "/out/astro.ffpkg",
                "/dumps/astro"
            ]
        );
    }

    #[test]
    fn test_build_command_without_label() {
        let cmd = build_command(
            &tool(),
            32768,
            4096,
            "  ",
            Path::new("/out/x.img"),
            Path::new("/dumps/x"),
        );
        assert!(!cmd.display().contains("-L"));
    }
}
