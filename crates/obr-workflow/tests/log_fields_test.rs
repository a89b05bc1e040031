//! Structured log fields emitted across the workspace stay within the
//! documented vocabulary of `obr_core::logging`.

use std::fs;
use std::path::{Path, PathBuf};

use obr_core::logging::SUBSYSTEM_VALUES;

fn workspace_sources() -> Vec<PathBuf> {
    let crates = Path::new(env!("CARGO_MANIFEST_DIR")).join("..");
    let mut files = Vec::new();
    for krate in ["obr-core", "obr-db", "obr-workflow"] {
        let src = crates.join(krate).join("src");
        for entry in fs::read_dir(&src).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().is_some_and(|e| e == "rs") {
                files.push(path);
            }
        }
    }
    files
}

#[test]
fn test_every_subsystem_value_is_documented() {
    let mut seen = 0;
    for path in workspace_sources() {
        let text = fs::read_to_string(&path).unwrap();
        for (start, marker) in text.match_indices("subsystem = \"") {
            let rest = &text[start + marker.len()..];
            let value = &rest[..rest.find('"').unwrap()];
            assert!(
                SUBSYSTEM_VALUES.contains(&value),
                "{} logs subsystem {:?}, not in {:?}",
                path.display(),
                value,
                SUBSYSTEM_VALUES
            );
            seen += 1;
        }
    }
    assert!(seen > 0);
}

#[test]
fn test_database_subsystem_is_used_by_obr_db() {
    let pool = fs::read_to_string(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../obr-db/src/pool.rs"),
    )
    .unwrap();
    assert!(pool.contains("subsystem = \"database\""));
    assert!(SUBSYSTEM_VALUES.contains(&"database"));
    assert!(!SUBSYSTEM_VALUES.contains(&"db"));
}
