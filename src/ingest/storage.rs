// Shared-storage file handling for the ingest service
// Content-addressed layout, durable writes (flush + fsync before the DB row
// commits) and the orphan sweep for files whose DB insert never happened.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::database::Database;

/// Suffix for in-progress writes; never matches a chunk row.
const PARTIAL_SUFFIX: &str = ".part";

/// Relative storage path for a chunk. The layout is part of the external
/// interface and must not drift:
/// `audio/<point_id>/<register_id>/<YYYY-MM-DD>/<HH>/chunk_<start_ts>_<chunk_id>.ogg`
pub fn chunk_relative_path(
    point_id: &str,
    register_id: &str,
    start_ts: DateTime<Utc>,
    chunk_id: Uuid,
) -> String {
    format!(
        "audio/{}/{}/{}/{}/chunk_{}_{}.ogg",
        point_id,
        register_id,
        start_ts.format("%Y-%m-%d"),
        start_ts.format("%H"),
        start_ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        chunk_id
    )
}

/// Write a chunk payload durably: temp file, flush, fsync, rename.
///
/// The rename is atomic on POSIX filesystems, so readers never observe a
/// half-written final path; a crash leaves only a `.part` file for the sweep.
pub async fn store_chunk_file(root: &Path, relative_path: &str, bytes: &[u8]) -> Result<()> {
    let final_path = root.join(relative_path);
    let parent = final_path
        .parent()
        .context("Chunk path has no parent directory")?;
    tokio::fs::create_dir_all(parent)
        .await
        .context("Failed to create chunk directory")?;

    let partial_path = final_path.with_extension(format!("ogg{}", PARTIAL_SUFFIX));

    let mut file = tokio::fs::File::create(&partial_path)
        .await
        .context("Failed to create chunk file")?;
    tokio::io::AsyncWriteExt::write_all(&mut file, bytes)
        .await
        .context("Failed to write chunk payload")?;
    file.sync_all().await.context("Failed to fsync chunk file")?;
    drop(file);

    tokio::fs::rename(&partial_path, &final_path)
        .await
        .context("Failed to move chunk file into place")?;

    Ok(())
}

/// Read a stored chunk file back.
pub async fn read_chunk_file(root: &Path, relative_path: &str) -> Result<Vec<u8>> {
    let path = root.join(relative_path);
    tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read chunk file {:?}", path))
}

/// Whether the storage volume accepts writes. Used by /health.
pub async fn storage_writable(root: &Path) -> bool {
    let probe = root.join(".health-probe");
    let ok = tokio::fs::write(&probe, b"ok").await.is_ok();
    if ok {
        let _ = tokio::fs::remove_file(&probe).await;
    }
    ok
}

/// Delete audio files older than `max_age` that have no matching chunk row.
///
/// Covers two leak paths: a crash between file write and DB insert, and
/// abandoned `.part` files. Returns the number of files removed.
pub async fn sweep_orphans(root: &Path, db: &Database, max_age: Duration) -> Result<u64> {
    let audio_root = root.join("audio");
    if !audio_root.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now() - max_age;

    // Directory walking is blocking; collect candidates off the runtime.
    let candidates = {
        let audio_root = audio_root.clone();
        tokio::task::spawn_blocking(move || collect_old_files(&audio_root, cutoff))
            .await
            .context("Orphan sweep task panicked")?
    };

    let mut removed = 0u64;
    for path in candidates {
        let keep = match chunk_id_from_path(&path) {
            Some(chunk_id) => db.chunk_exists(chunk_id).await.unwrap_or(true),
            // Partial or unparsable names never correspond to a row.
            None => false,
        };

        if !keep {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    log::info!("Removed orphan audio file {:?}", path);
                    removed += 1;
                }
                Err(e) => log::warn!("Failed to remove orphan {:?}: {}", path, e),
            }
        }
    }

    Ok(removed)
}

fn collect_old_files(audio_root: &Path, cutoff: SystemTime) -> Vec<PathBuf> {
    WalkDir::new(audio_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.ends_with(".ogg") || name.ends_with(PARTIAL_SUFFIX)
        })
        .filter(|entry| {
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|modified| modified < cutoff)
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}

/// Parse the chunk id out of `chunk_<start_ts>_<chunk_id>.ogg`.
fn chunk_id_from_path(path: &Path) -> Option<Uuid> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".ogg")?;
    let (_, id) = stem.rsplit_once('_')?;
    Uuid::parse_str(id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_bit_exact() {
        let start: DateTime<Utc> = "2025-03-01T09:05:30Z".parse().unwrap();
        let chunk_id = Uuid::parse_str("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap();
        assert_eq!(
            chunk_relative_path("p01", "r02", start, chunk_id),
            "audio/p01/r02/2025-03-01/09/\
             chunk_2025-03-01T09:05:30Z_6ba7b810-9dad-11d1-80b4-00c04fd430c8.ogg"
        );
    }

    #[test]
    fn chunk_id_parses_from_layout() {
        let start: DateTime<Utc> = "2025-03-01T23:59:59Z".parse().unwrap();
        let chunk_id = Uuid::new_v4();
        let rel = chunk_relative_path("p", "r", start, chunk_id);
        assert_eq!(chunk_id_from_path(Path::new(&rel)), Some(chunk_id));
    }

    #[test]
    fn partial_files_have_no_chunk_id() {
        assert_eq!(
            chunk_id_from_path(Path::new("audio/p/r/chunk_x_y.ogg.part")),
            None
        );
        assert_eq!(chunk_id_from_path(Path::new("audio/p/r/readme.txt")), None);
    }

    #[tokio::test]
    async fn store_writes_final_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let start: DateTime<Utc> = "2025-03-01T09:00:00Z".parse().unwrap();
        let rel = chunk_relative_path("p01", "r01", start, Uuid::new_v4());

        store_chunk_file(dir.path(), &rel, b"OggS-payload")
            .await
            .unwrap();

        let stored = read_chunk_file(dir.path(), &rel).await.unwrap();
        assert_eq!(stored, b"OggS-payload");

        // No .part residue next to the final file.
        let parent = dir.path().join(&rel);
        let parent = parent.parent().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(parent)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn storage_probe_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        assert!(storage_writable(dir.path()).await);
        assert!(!dir.path().join(".health-probe").exists());
    }
}
