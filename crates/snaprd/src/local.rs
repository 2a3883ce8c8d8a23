//! Local snapshot file discovery: filenames encode slot numbers (one for a
//! full snapshot, two for an incremental one: base slot then incremental
//! slot) followed by a hash suffix. The parser pulls out the numeric runs
//! and ignores everything else about the name.

use std::path::{Path, PathBuf};

pub fn parse_slots(name: &str) -> Option<(u64, Option<u64>)> {
    let mut nums = name
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty());
    let first: u64 = nums.next()?.parse().ok()?;
    let second = nums.next().and_then(|s| s.parse().ok());
    Some((first, second))
}

/// Finds the highest-slot file under `dir` whose name starts with `prefix`,
/// returning its parsed slot pair and path.
pub fn find_latest(dir: &Path, prefix: &str) -> Option<(u64, Option<u64>, PathBuf)> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            if !name.starts_with(prefix) {
                return None;
            }
            let (slot, inc) = parse_slots(&name)?;
            Some((slot, inc, e.path()))
        })
        .max_by_key(|(slot, _, _)| *slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_snapshot_name() {
        assert_eq!(parse_slots("snapshot-12345-abcdef0123.tar.zst"), Some((12345, Some(123))));
    }

    #[test]
    fn parses_incremental_snapshot_name() {
        assert_eq!(
            parse_slots("incremental-snapshot-100-200-abcdef0123.tar.zst"),
            Some((100, Some(200)))
        );
    }

    #[test]
    fn finds_the_highest_slot_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("snapshot-100-aaaa1111.tar.zst"), b"").unwrap();
        std::fs::write(dir.path().join("snapshot-200-bbbb2222.tar.zst"), b"").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"").unwrap();
        let (slot, _, path) = find_latest(dir.path(), "snapshot-").unwrap();
        assert_eq!(slot, 200);
        assert!(path.ends_with("snapshot-200-bbbb2222.tar.zst"));
    }
}
