use std::path::{Path, PathBuf};

use slipcheck_core::MimeType;
use tokio::sync::mpsc;

/// Forward newly created files in `watch_dir` to `tx`. The returned watcher
/// must be kept alive for as long as intake should run.
pub fn spawn_intake_watcher(
    watch_dir: &Path,
    tx: mpsc::Sender<PathBuf>,
) -> notify::Result<impl notify::Watcher> {
    use notify::{EventKind, RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        match event {
            Ok(ev) if matches!(ev.kind, EventKind::Create(_)) => {
                for path in ev.paths.into_iter().filter(|p| is_slip(p)) {
                    if tx.try_send(path.clone()).is_err() {
                        tracing::warn!(path = %path.display(), "Intake backlog full, dropping file");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Intake watcher error"),
        }
    })?;

    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Supported extension, not a dotfile or an in-progress download.
pub fn is_slip(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    let supported = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MimeType::from_extension(e).is_ok());
    !hidden && supported
}
