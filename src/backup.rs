use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/assess.sqlite3";
pub const BUNDLE_FORMAT: &str = "assess-workspace-v1";

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub bundle_path: PathBuf,
    pub bundle_format: String,
    pub db_sha256: String,
}

/// Archive the workspace database into a timestamped zip next to it (or in
/// `dest_dir`). The manifest carries a sha256 digest per entry so a restore
/// tool can verify the payload before touching anything.
pub fn backup_workspace(
    workspace_path: &Path,
    dest_dir: Option<&Path>,
) -> anyhow::Result<BackupSummary> {
    let db_path = workspace_path.join("assess.sqlite3");
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    let dest = dest_dir.unwrap_or(workspace_path);
    std::fs::create_dir_all(dest)
        .with_context(|| format!("failed to create directory {}", dest.to_string_lossy()))?;
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let out_path = dest.join(format!("assess-backup-{}.zip", stamp));

    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.to_string_lossy()))?;
    let db_sha256 = format!("{:x}", Sha256::digest(&db_bytes));

    let out_file = File::create(&out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "files": { DB_ENTRY: { "sha256": db_sha256 } },
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(BackupSummary {
        bundle_path: out_path,
        bundle_format: BUNDLE_FORMAT.to_string(),
        db_sha256,
    })
}
