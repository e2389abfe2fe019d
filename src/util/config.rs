use std::path::{Path, PathBuf};

/// If `path` is relative, joins it to `base`; otherwise returns it unchanged.
pub fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Resolves a cache path given in a settings file against that file's directory.
pub fn cache_path_for_settings(settings_path: &Path, cache: &Path) -> PathBuf {
    let base = settings_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    resolve_relative(&base, cache)
}

/// Cache file used when a caller enables caching without naming a file.
pub fn default_cache_path(bucket: &str) -> PathBuf {
    std::env::temp_dir().join(bucket)
}
