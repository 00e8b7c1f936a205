// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later
//
// Packaging only: assembles the release binary and a KernelSU-style module
// skeleton into a flashable zip. No design content lives here.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const MODULE_ID: &str = "hymo";
const MODULE_NAME: &str = "HymoFS Module Overlay";
const MODULE_AUTHOR: &str = "Meta-Hybrid Mount Authors";
const MODULE_DESCRIPTION: &str = "HymoFS kernel-shim module overlay planner and client";

#[derive(Parser)]
#[command(name = "xtask", about = "Build and packaging helper for hymod")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble target/<profile>/hymod plus the module skeleton into a
    /// flashable zip at `output`.
    Package {
        #[arg(long, default_value = "release")]
        profile: String,
        #[arg(long, default_value = "dist/hymo-module.zip")]
        output: PathBuf,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        version_code: Option<u32>,
        /// Sign the assembled zip with ksusig after writing it.
        #[arg(long)]
        sign: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Package { profile, output, version, version_code, sign } => {
            package(&profile, &output, version.as_deref(), version_code, sign)
        }
    }
}

fn workspace_root() -> Result<PathBuf> {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .context("xtask manifest has no parent directory")
}

fn module_prop(version: &str, version_code: u32) -> String {
    format!(
        "id={MODULE_ID}\n\
         name={MODULE_NAME}\n\
         version={version}\n\
         versionCode={version_code}\n\
         author={MODULE_AUTHOR}\n\
         description={MODULE_DESCRIPTION}\n"
    )
}

const SERVICE_SH: &str = "#!/system/bin/sh\n\
MODDIR=${0%/*}\n\
\n\
\"$MODDIR/hymod\" run --config /data/adb/hymo/config.toml\n";

/// Copies the release binary and renders `module.prop`/`service.sh` into a
/// scratch directory, then zips it. With `sign`, the archive is signed the
/// way a KernelSU-style recovery zip expects (AnyKernel3 end-of-archive
/// signature block), via `ksusig`.
fn package(profile: &str, output: &Path, version: Option<&str>, version_code: Option<u32>, sign: bool) -> Result<()> {
    let root = workspace_root()?;
    let binary_path = root.join("target").join(profile).join("hymod");
    if !binary_path.exists() {
        bail!("release binary not found at {} — run `cargo build --profile {profile}` first", binary_path.display());
    }

    let staging = tempfile::tempdir().context("failed to create packaging staging dir")?;
    let module_dir = staging.path().join(MODULE_ID);
    fs::create_dir_all(&module_dir).context("failed to create module staging directory")?;

    fs::copy(&binary_path, module_dir.join("hymod")).context("failed to stage hymod binary")?;

    let version = version.unwrap_or("0.1.0").to_string();
    let version_code = version_code.unwrap_or(1);
    fs::write(module_dir.join("module.prop"), module_prop(&version, version_code))
        .context("failed to write module.prop")?;
    fs::write(module_dir.join("service.sh"), SERVICE_SH).context("failed to write service.sh")?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).context("failed to create output directory")?;
    }
    write_zip(&module_dir, output).context("failed to write module zip")?;

    if sign {
        sign_zip(output)?;
    }

    println!("packaged {} ({version} / {version_code}) -> {}", MODULE_ID, output.display());
    Ok(())
}

fn write_zip(src_dir: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in walk_files(src_dir)? {
        let relative = entry
            .strip_prefix(src_dir.parent().unwrap_or(src_dir))
            .unwrap_or(&entry)
            .to_string_lossy()
            .replace('\\', "/");
        writer.start_file(relative, options).context("failed to start zip entry")?;
        let contents = fs::read(&entry).with_context(|| format!("failed to read {}", entry.display()))?;
        writer.write_all(&contents).context("failed to write zip entry")?;
    }

    writer.finish().context("failed to finalize zip archive")?;
    Ok(())
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_files(&path)?);
        } else {
            out.push(path);
        }
    }
    Ok(out)
}

fn sign_zip(path: &Path) -> Result<()> {
    ksusig::sign_file(path).with_context(|| format!("failed to sign {}", path.display()))?;
    Ok(())
}
