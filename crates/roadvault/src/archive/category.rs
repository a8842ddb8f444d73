use std::fmt;
use std::path::{Path, PathBuf};

/// Data categories copied off the workspace, in archive order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Log,
    Bag,
    Core,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Log, Category::Bag, Category::Core];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Log => "log",
            Category::Bag => "bag",
            Category::Core => "core",
        }
    }

    /// `<data_dir>/<category>`
    pub fn source_in(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.as_str())
    }

    /// `<snapshot>/<category>`
    pub fn destination_in(&self, snapshot_dir: &Path) -> PathBuf {
        snapshot_dir.join(self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
