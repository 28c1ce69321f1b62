use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory and file constants
// ---------------------------------------------------------------------------

pub const VF_DIR: &str = ".vf";
pub const CONFIG_FILE: &str = ".vf/config.yaml";

pub const TASK_QUEUE_FILE: &str = "TASK_QUEUE.vf.json";
pub const NAME_ID_FILE: &str = "NAME_ID.vf.json";

/// Relative location of the steps directory below a project root.
pub const STEPS_DIR: &str = "llm_rules/steps";

/// How many parent directories step discovery climbs before giving up.
pub const STEPS_DISCOVERY_DEPTH: usize = 10;

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn vf_dir(root: &Path) -> PathBuf {
    root.join(VF_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn steps_dir(root: &Path) -> PathBuf {
    root.join(STEPS_DIR)
}

/// Walk upward from `start` (at most [`STEPS_DISCOVERY_DEPTH`] levels) looking
/// for an `llm_rules/steps` directory.
pub fn discover_steps_dir(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    for _ in 0..=STEPS_DISCOVERY_DEPTH {
        let current = dir?;
        let candidate = current.join(STEPS_DIR);
        if candidate.is_dir() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn discovers_steps_dir_from_nested_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STEPS_DIR)).unwrap();
        let nested = dir.path().join("layer/themes/demo/src");
        std::fs::create_dir_all(&nested).unwrap();

        let found = discover_steps_dir(&nested).unwrap();
        assert_eq!(found, dir.path().join(STEPS_DIR));
    }

    #[test]
    fn discovery_stops_after_depth_limit() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STEPS_DIR)).unwrap();
        let mut deep = dir.path().to_path_buf();
        for i in 0..12 {
            deep = deep.join(format!("d{i}"));
        }
        std::fs::create_dir_all(&deep).unwrap();

        assert!(discover_steps_dir(&deep).is_none());
    }
}
