// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! EagerFS FUSE host — mounts a pass-through volume that answers
//! mutations before the backing storage has applied them. Intended for
//! batch pipelines where the whole output tree can be discarded and
//! recomputed on failure.

mod adapter;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use adapter::EagerFuse;
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use eagerfs_core::{Engine, Options};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "EagerFS pass-through FUSE host")]
struct Args {
    /// Backing directory whose tree is mirrored through the mount
    source: PathBuf,

    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Option file (JSON), field-for-field the engine option set
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Executor pool size override
    #[arg(long)]
    threads: Option<usize>,

    /// Serialize mutations against directory enumerations
    #[arg(long)]
    restrictive_dirs: bool,

    /// Close descriptors as soon as the executor gets to them instead of
    /// parking them until unmount
    #[arg(long)]
    no_close_very_late: bool,

    /// Honour fsync instead of ignoring it
    #[arg(long)]
    honour_fsync: bool,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,
}

fn load_options(config_path: Option<&PathBuf>) -> Result<Options> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading option file {}", path.display()))?;
            let options: Options = serde_json::from_str(&content)
                .with_context(|| format!("parsing option file {}", path.display()))?;
            Ok(options)
        }
        None => Ok(Options::default()),
    }
}

fn apply_overrides(options: &mut Options, args: &Args) {
    if let Some(threads) = args.threads {
        options.num_threads = threads;
    }
    if args.restrictive_dirs {
        options.restrictive_dirs = true;
    }
    if args.no_close_very_late {
        options.close_very_late = false;
    }
    if args.honour_fsync {
        options.ignore_fsync = false;
    }
}

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let mut options = load_options(args.config.as_ref())?;
    apply_overrides(&mut options, &args);

    info!(
        source = %args.source.display(),
        mount = %args.mount_point.display(),
        threads = options.num_threads,
        "starting EagerFS host"
    );

    // The mount mirrors the backing tree's permissions as-is.
    unsafe { libc::umask(0) };

    let engine = Arc::new(Engine::new(&args.source, options)?);
    let filesystem = EagerFuse::new(Arc::clone(&engine));

    let mut mount_options = vec![
        fuser::MountOption::FSName("eagerfs".to_string()),
        fuser::MountOption::Subtype("eagerfs".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];
    if args.allow_other {
        mount_options.push(fuser::MountOption::AllowOther);
    }
    if args.allow_root {
        mount_options.push(fuser::MountOption::AllowRoot);
    }
    if args.auto_unmount {
        mount_options.push(fuser::MountOption::AutoUnmount);
    }

    info!("mounting filesystem");
    let session = fuser::spawn_mount2(filesystem, &args.mount_point, &mount_options)?;
    info!("mounted; blocking until unmount");
    match session.guard.join() {
        Ok(Ok(())) => info!("FUSE session exited cleanly"),
        Ok(Err(err)) => return Err(err.into()),
        Err(panic) => return Err(anyhow!("FUSE session panicked: {:?}", panic)),
    }

    // Drain whatever the unmount did not already flush out.
    engine.shutdown();
    Ok(())
}
