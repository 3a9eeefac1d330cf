//! Thin command-line surface over the starter core.

use crate::config::types::CommonConfig;
use crate::engine::{direct, image, Engine};
use crate::utils::user;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a container from a single-file image bundle
    Run {
        /// Image file backing the container
        #[arg(long)]
        image: Option<PathBuf>,

        /// Engine kind
        #[arg(long, default_value = image::NAME)]
        engine: String,

        /// Mount point for the container root (a per-instance
        /// directory under the temp dir when omitted)
        #[arg(long)]
        rootfs: Option<PathBuf>,

        /// Filesystem type inside the image
        #[arg(long, default_value = "squashfs")]
        fstype: String,

        /// Read the image passphrase from this file
        #[arg(long)]
        passphrase_file: Option<PathBuf>,

        /// Mount the image read-write
        #[arg(long)]
        writable: bool,

        /// Create a PID namespace
        #[arg(long)]
        pid: bool,

        /// Create a network namespace
        #[arg(long)]
        net: bool,

        /// Create a user namespace
        #[arg(long)]
        userns: bool,

        /// Payload command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            image,
            engine,
            rootfs,
            fstype,
            passphrase_file,
            writable,
            pid,
            net,
            userns,
            command,
        } => {
            let container_id = Uuid::new_v4().to_string();
            let namespaces = serde_json::json!({
                "pid": pid,
                "network": net,
                "user": userns,
            });

            let config = match engine.as_str() {
                image::NAME => {
                    let rootfs = rootfs.unwrap_or_else(|| {
                        std::env::temp_dir().join(format!("cryptbox-{container_id}"))
                    });
                    let key = passphrase_file
                        .map(read_passphrase)
                        .transpose()?;
                    serde_json::json!({
                        "rootfs": rootfs,
                        "command": command,
                        "filesystem": fstype,
                        "key": key,
                        "writable": writable,
                        "namespaces": namespaces,
                    })
                }
                direct::NAME => serde_json::json!({
                    "command": command,
                    "namespaces": namespaces,
                }),
                other => bail!("unknown engine {other}"),
            };

            let image = match (engine.as_str(), image) {
                (direct::NAME, img) => img.unwrap_or_else(|| PathBuf::from("/dev/null")),
                (_, Some(img)) => img,
                (_, None) => bail!("--image is required for the {engine} engine"),
            };

            let common = CommonConfig {
                engine_name: engine.clone(),
                container_id,
                image,
                original_user: user::current_original()
                    .context("resolving the invoking user")?,
                namespaces: Default::default(),
                telemetry_socket: None,
            };

            let engine = Engine::from_name(&engine, common, config)?;
            crate::core::master::boot(engine)
        }
    }
}

fn read_passphrase(path: PathBuf) -> Result<Vec<u8>> {
    let mut data = std::fs::read(&path)
        .with_context(|| format!("reading passphrase from {}", path.display()))?;
    // A trailing newline is an artifact of how the file was written,
    // not part of the passphrase.
    while data.last() == Some(&b'\n') {
        data.pop();
    }
    Ok(data)
}
