/// Startup discovery: find the latest snapshot, or collect the startup
/// source files when no snapshot exists yet.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

static STARTUP_SOURCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(core|db|test).*\.js$").expect("pattern compiles"));

/// The lexicographically greatest `.city` file, which by the filename
/// format is the most recent snapshot.
pub fn latest_snapshot(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".city") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names.pop().map(|n| dir.join(n)))
}

/// Startup sources in lexical order, each as (path, contents).
pub fn startup_sources(dir: &Path) -> io::Result<Vec<(PathBuf, String)>> {
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if STARTUP_SOURCE.is_match(&name) {
            names.push(name);
        }
    }
    names.sort();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        let text = fs::read_to_string(&path)?;
        out.push((path, text));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_pattern_matches_expected_names() {
        for name in ["core_base.js", "db_world.js", "test_smoke.js", "core.js"] {
            assert!(STARTUP_SOURCE.is_match(name), "{} should match", name);
        }
        for name in ["main.js", "core.js.bak", "db.city", "score.js"] {
            assert!(!STARTUP_SOURCE.is_match(name), "{} should not match", name);
        }
    }
}
