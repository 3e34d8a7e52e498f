//! Diagnostics bundles.
//!
//! Before a self-initiated reboot (memory pressure, prolonged outage) the
//! runtime captures a gzip-compressed text dump of the host state so the
//! cause can be read after the fact. Bundles accumulate locally when offline
//! and are uploaded when connectivity returns.

use crate::cloud::AsyncCloudConnector;
use crate::error::Result;
use crate::naming;
use crate::record::StorageTier;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Local bundles are capped so a reboot loop cannot fill the disk.
pub const MAX_LOCAL_BUNDLES: usize = 10;

const BAR: &str =
    "========================================================================";

const COMMANDS: &[(&str, &str, &[&str])] = &[
    ("System", "uname", &["-a"]),
    ("Uptime", "uptime", &[]),
    ("Network interfaces", "ip", &["addr"]),
    ("Routes", "ip", &["route"]),
    ("Disk usage", "df", &["-h"]),
    ("Memory", "free", &["-m"]),
    ("Power and thermal", "vcgencmd", &["get_throttled"]),
    ("Processes", "ps", &["aux", "--sort=-rss"]),
];

fn command_section(title: &str, program: &str, args: &[&str]) -> String {
    let mut out = format!("{BAR}\n{title}: {program} {}\n{BAR}\n", args.join(" "));
    match Command::new(program).args(args).output() {
        Ok(output) => {
            out.push_str(&format!("EXIT CODE: {}\n", output.status));
            out.push_str("STDOUT:\n");
            out.push_str(&String::from_utf8_lossy(&output.stdout));
            out.push_str("STDERR:\n");
            out.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Err(e) => {
            out.push_str(&format!("COMMAND FAILED TO RUN: {e}\n"));
        }
    }
    out.push('\n');
    out
}

fn text_section(title: &str, body: &str) -> String {
    format!("{BAR}\n{title}\n{BAR}\n{body}\n\n")
}

/// Capture a bundle into `diags_dir`, pruning the oldest beyond the cap.
/// `config_dump` and `health_dump` are appended verbatim.
pub fn collect(
    diags_dir: &Path,
    device_id: &str,
    reason: &str,
    config_dump: &str,
    health_dump: &str,
) -> Result<PathBuf> {
    std::fs::create_dir_all(diags_dir)?;

    let mut text = text_section("Diagnostics reason", reason);
    for (title, program, args) in COMMANDS {
        text.push_str(&command_section(title, program, args));
    }
    text.push_str(&text_section("Configuration", config_dump));
    text.push_str(&text_section("Device health", health_dump));

    let path = diags_dir.join(naming::diags_filename(device_id));
    let file = std::fs::File::create(&path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(text.as_bytes())?;
    encoder.finish()?;
    info!("Captured diagnostics bundle {} ({reason})", path.display());

    prune(diags_dir)?;
    Ok(path)
}

/// Enqueue every local bundle for upload. Files are consumed at enqueue time.
pub fn upload_all(
    diags_dir: &Path,
    engine: &AsyncCloudConnector,
    container: &str,
) -> Result<usize> {
    let mut uploaded = 0;
    if !diags_dir.is_dir() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(diags_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".txt.gz") {
            continue;
        }
        engine.upload_file(container, name, &path, StorageTier::Cool)?;
        uploaded += 1;
    }
    if uploaded > 0 {
        info!("Enqueued {uploaded} diagnostics bundles for upload");
    }
    Ok(uploaded)
}

fn prune(diags_dir: &Path) -> Result<()> {
    let mut bundles: Vec<PathBuf> = std::fs::read_dir(diags_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".txt.gz"))
                .unwrap_or(false)
        })
        .collect();
    if bundles.len() <= MAX_LOCAL_BUNDLES {
        return Ok(());
    }
    // Filenames embed the capture timestamp, so name order is age order.
    bundles.sort();
    let excess = bundles.len() - MAX_LOCAL_BUNDLES;
    for path in bundles.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Could not prune old bundle {}: {e}", path.display());
        }
    }
    Ok(())
}
