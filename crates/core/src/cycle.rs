//! Cycle naming
//!
//! A cycle is an integer identifying one time bucket of the queue, and each
//! cycle lives in its own segment file. The mapping between wall-clock time
//! and cycle numbers belongs to the roll scheme and is not modelled here;
//! this module only covers the file name <-> cycle relation the directory
//! listing needs.

use std::path::Path;
use std::sync::Arc;

/// Suffix of segment files
pub const SEGMENT_SUFFIX: &str = ".cq4";
/// Suffix of shared counter table files
pub const TABLE_SUFFIX: &str = ".cq4t";
/// File name of the directory listing table inside a queue directory
pub const DIRECTORY_LISTING_FILE: &str = "directory-listing.cq4t";

/// Maps segment files to cycles and back.
///
/// `cycle_of` must be pure: the same file name always yields the same cycle.
pub trait CycleNaming: Send + Sync {
    /// Cycle stored in `file`, or `None` when the name is not a segment name
    fn cycle_of(&self, file: &Path) -> Option<i32>;

    /// File name (not path) of the segment for `cycle`
    fn file_name(&self, cycle: i32) -> String;
}

/// Zero-padded decimal cycle numbers: `00000042.cq4`.
#[derive(Debug, Clone)]
pub struct NumberedCycles {
    width: usize,
}

impl NumberedCycles {
    /// Names padded to `width` digits
    pub fn new(width: usize) -> Self {
        NumberedCycles { width }
    }
}

impl Default for NumberedCycles {
    fn default() -> Self {
        NumberedCycles::new(8)
    }
}

impl CycleNaming for NumberedCycles {
    fn cycle_of(&self, file: &Path) -> Option<i32> {
        let name = file.file_name()?.to_str()?;
        let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
        stem.parse().ok()
    }

    fn file_name(&self, cycle: i32) -> String {
        format!("{:0width$}{}", cycle, SEGMENT_SUFFIX, width = self.width)
    }
}

/// Shared handle to a naming scheme
pub type SharedCycleNaming = Arc<dyn CycleNaming>;

/// True when `file` carries the segment suffix.
pub fn is_segment_file(file: &Path) -> bool {
    file.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(SEGMENT_SUFFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_numbered_round_trip() {
        let naming = NumberedCycles::default();
        let name = naming.file_name(42);
        assert_eq!(name, "00000042.cq4");
        assert_eq!(naming.cycle_of(Path::new(&name)), Some(42));
    }

    #[test]
    fn test_numbered_rejects_foreign_names() {
        let naming = NumberedCycles::default();
        assert_eq!(naming.cycle_of(Path::new("directory-listing.cq4t")), None);
        assert_eq!(naming.cycle_of(Path::new("notes.txt")), None);
        assert_eq!(naming.cycle_of(Path::new("abc.cq4")), None);
    }

    #[test]
    fn test_numbered_reads_full_paths() {
        let naming = NumberedCycles::new(4);
        let path = PathBuf::from("/tmp/queue").join(naming.file_name(7));
        assert_eq!(naming.cycle_of(&path), Some(7));
    }

    #[test]
    fn test_is_segment_file() {
        assert!(is_segment_file(Path::new("00000001.cq4")));
        assert!(!is_segment_file(Path::new(DIRECTORY_LISTING_FILE)));
    }
}
