// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use hymod::config::Config;
use hymod::defs::{CONFIG_FILE_DEFAULT, RUN_DIR};
use hymod::inventory;
use hymod::kernel::HymoClient;
use hymod::mount::{hymofs, magic};
use hymod::state::RuntimeState;
use hymod::user_rules;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "hymod", about = "HymoFS module-overlay planner and kernel control-plane client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full pipeline: scan inventory, pick a backend, apply it, save state.
    Run {
        #[arg(long = "config")]
        config: Option<PathBuf>,
        #[arg(short = 'm', long = "moduledir")]
        moduledir: Option<PathBuf>,
        #[arg(short = 's', long = "storage-root")]
        storage_root: Option<PathBuf>,
        #[arg(short = 'p', long = "partitions", value_delimiter = ',')]
        partitions: Vec<String>,
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
        #[arg(long = "ignore-protocol-mismatch")]
        ignore_protocol_mismatch: bool,
    },
    /// Print cached HymoFS status and the last runtime-state snapshot.
    Status,
    /// List the module inventory.
    Modules {
        #[arg(long = "json")]
        json: bool,
        #[arg(long = "config")]
        config: Option<PathBuf>,
    },
    /// User hide-rule store operations.
    Hide {
        #[command(subcommand)]
        action: HideAction,
    },
    /// Write a default config file.
    GenConfig {
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Print the resolved configuration.
    ShowConfig {
        #[arg(long = "config")]
        config: Option<PathBuf>,
    },
    /// Run the bind-mount union planner directly. Must run as uid 0.
    MagicMount {
        #[arg(long = "config")]
        config: Option<PathBuf>,
        #[arg(short = 't', long = "tmpdir")]
        tmpdir: Option<PathBuf>,
        #[arg(short = 'p', long = "partitions", value_delimiter = ',')]
        partitions: Vec<String>,
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
}

#[derive(Subcommand)]
enum HideAction {
    Add { path: String },
    Remove { path: String },
    List,
}

fn load_config(path: &Option<PathBuf>) -> Config {
    let path = path.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE_DEFAULT));
    Config::from_file(&path).unwrap_or_default()
}

fn log_path() -> PathBuf {
    Path::new(RUN_DIR).join("hymod.log")
}

fn main() {
    if let Err(e) = run() {
        log::error!("Fatal Error: {:#}", e);
        eprintln!("Fatal Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, moduledir, storage_root, partitions, verbose, ignore_protocol_mismatch } => {
            hymod::logger::init(verbose, &log_path()).ok();
            let mut cfg = load_config(&config);
            cfg.merge_with_cli(moduledir, storage_root, None, verbose, partitions, ignore_protocol_mismatch);
            run_pipeline(&cfg)
        }
        Commands::Status => cmd_status(),
        Commands::Modules { json, config } => cmd_modules(&load_config(&config), json),
        Commands::Hide { action } => cmd_hide(action),
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::ShowConfig { config } => cmd_show_config(&load_config(&config)),
        Commands::MagicMount { config, tmpdir, partitions, verbose } => {
            hymod::logger::init(verbose, &log_path()).ok();
            let mut cfg = load_config(&config);
            cfg.merge_with_cli(None, None, tmpdir, verbose, partitions, false);
            cmd_magic_mount(&cfg)
        }
    }
}

/// `hymod run`: scan inventory, pick kernel-shim or magic-mount, save a
/// state snapshot. The kernel-shim path is preferred whenever
/// `HymoClient::is_available` (or the caller tolerates a version skew);
/// otherwise the planner falls back to the bind-mount union engine.
fn run_pipeline(config: &Config) -> Result<()> {
    let modules = inventory::scan_modules(&config.moduledir);
    let status = HymoClient::check_status();
    let use_kernel_shim = status == hymod::kernel::HymoFsStatus::Available
        || (config.ignore_protocol_mismatch
            && matches!(status, hymod::kernel::HymoFsStatus::KernelTooOld | hymod::kernel::HymoFsStatus::ModuleTooOld));

    let state = if use_kernel_shim {
        let plan = hymofs::run(config, &modules);
        RuntimeState::for_hymofs(now(), plan.hymofs_module_ids)
    } else {
        let stats = magic::run(config, &modules).context("magic-mount run failed")?;
        RuntimeState::for_magic_mount(now(), stats)
    };

    if let Err(e) = state.save() {
        log::warn!("failed to save runtime state: {e:#}");
    }
    Ok(())
}

fn cmd_status() -> Result<()> {
    let status = HymoClient::check_status();
    println!("HymoFS status: {status:?}");
    match RuntimeState::load() {
        Ok(state) => {
            println!("backend: {}", state.backend);
            println!("last run: {}", state.timestamp);
            if !state.hymofs_module_ids.is_empty() {
                println!("hymofs modules: {}", state.hymofs_module_ids.join(", "));
            }
            if let Some(stats) = state.magic_mount_stats {
                println!(
                    "magic-mount: {} modules, {} nodes mounted, {} skipped, {} whiteouts, {} failures",
                    stats.modules_total, stats.nodes_mounted, stats.nodes_skipped, stats.nodes_whiteout, stats.nodes_fail
                );
            }
        }
        Err(_) => println!("no prior run recorded"),
    }
    Ok(())
}

fn cmd_modules(config: &Config, json: bool) -> Result<()> {
    let modules = inventory::scan_modules(&config.moduledir);
    let target_partitions = config.target_partitions();

    if json {
        let entries: Vec<_> = modules
            .iter()
            .map(|m| {
                let content_path = config.storage_root.join(&m.id);
                let contributes = target_partitions.iter().any(|p| hymod::utils::is_dir(&content_path.join(p)));
                serde_json::json!({
                    "id": m.id,
                    "mode": m.mode,
                    "contributes_content": contributes,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for m in &modules {
            let content_path = config.storage_root.join(&m.id);
            let contributes = target_partitions.iter().any(|p| hymod::utils::is_dir(&content_path.join(p)));
            println!("{}\tmode={}\tcontributes={}", m.id, m.mode, contributes);
        }
    }
    Ok(())
}

fn cmd_hide(action: HideAction) -> Result<()> {
    match action {
        HideAction::Add { path } => {
            user_rules::add_rule(&path)?;
            println!("added: {path}");
        }
        HideAction::Remove { path } => {
            if user_rules::remove_rule(&path)? {
                println!("removed: {path}");
            } else {
                println!("not present: {path}");
            }
        }
        HideAction::List => {
            for rule in user_rules::load_rules() {
                println!("{rule}");
            }
        }
    }
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let path = output.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_DEFAULT));
    Config::default().save_to_file(&path)?;
    println!("wrote default config to {}", path.display());
    Ok(())
}

fn cmd_show_config(config: &Config) -> Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn cmd_magic_mount(config: &Config) -> Result<()> {
    let modules = inventory::scan_modules(&config.moduledir);
    let stats = magic::run(config, &modules)?;
    println!(
        "magic-mount: {} modules, {} nodes mounted, {} skipped, {} whiteouts, {} failures",
        stats.modules_total, stats.nodes_mounted, stats.nodes_skipped, stats.nodes_whiteout, stats.nodes_fail
    );
    RuntimeState::for_magic_mount(now(), stats).save().ok();
    Ok(())
}

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
