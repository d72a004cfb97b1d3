//! Hash everything under an installation's locations.

use crate::disk_state::{DiskState, DiskStateEntry};
use crate::error::{Error, Result};
use crate::game::GameInstallation;
use crate::hash_cache::HashCache;
use crate::throttle::{CancellationToken, ThroughputLimiter};
use rayon::ThreadPool;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scan all locations of `installation` into a disk state.
///
/// Ignored paths and files outside every location are skipped. A file that
/// cannot be hashed is logged and skipped unless `fail_fast` is set. The
/// returned state has generation 0 until it is stored.
pub fn scan_installation(
    installation: &GameInstallation,
    cache: &Arc<HashCache>,
    pool: Arc<ThreadPool>,
    limiter: Arc<ThroughputLimiter>,
    cancel: &CancellationToken,
    fail_fast: bool,
) -> Result<DiskState> {
    let roots = installation.locations().values().cloned().collect();
    let results = cache.hash_folders(roots, pool, limiter, cancel.clone())?;

    // Nested locations yield the same file twice; the map keeps one
    let mut entries = BTreeMap::new();
    let mut skipped = 0usize;
    for result in results {
        match result {
            Ok(file) => {
                let Some(game_path) = installation.to_game_path(&file.path) else {
                    continue;
                };
                if installation.is_ignored(&game_path) {
                    continue;
                }
                entries.insert(
                    game_path,
                    DiskStateEntry {
                        hash: file.hash,
                        size: file.size,
                        modified_nanos: file.modified_nanos,
                    },
                );
            }
            Err(failure) => {
                if fail_fast || matches!(failure.error, Error::Cancelled) {
                    return Err(failure.error);
                }
                skipped += 1;
                tracing::warn!(
                    path = %failure.path.display(),
                    error = %failure.error,
                    "skipping file that could not be hashed"
                );
            }
        }
    }
    cancel.check()?;

    tracing::debug!(
        installation = installation.id(),
        files = entries.len(),
        skipped,
        "scanned installation"
    );
    Ok(DiskState {
        installation: installation.id().to_string(),
        generation: 0,
        entries,
    })
}
