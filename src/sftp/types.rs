//! SFTP data types

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fixed transfer chunk size
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Suffix of in-progress transfer artifacts, local and remote
pub const TEMP_SUFFIX: &str = ".part";

/// Suffix a replaced remote file is parked under during upload commit
pub const BACKUP_SUFFIX: &str = ".bak";

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// Attributes of one remote path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteStat {
    pub size: u64,
    /// Unix timestamp
    pub modified_at: u64,
    /// Raw mode bits, including the file type
    pub mode: u32,
    pub is_dir: bool,
}

/// Raw directory entry as returned by the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub stat: RemoteStat,
}

/// File entry shown to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub size_bytes: u64,
    /// Last modified time (Unix timestamp)
    pub modified_at: u64,
    /// `ls -l` style, e.g. "drwxr-xr-x"
    pub permissions_text: String,
    pub is_directory: bool,
}

impl From<RemoteEntry> for FileEntry {
    fn from(entry: RemoteEntry) -> Self {
        Self {
            permissions_text: format_mode(entry.stat.mode, entry.stat.is_dir),
            name: entry.name,
            size_bytes: entry.stat.size,
            modified_at: entry.stat.modified_at,
            is_directory: entry.stat.is_dir,
        }
    }
}

/// Directories first, then case-insensitive by name
pub fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        if a.is_directory != b.is_directory {
            return b.is_directory.cmp(&a.is_directory);
        }
        a.name.to_lowercase().cmp(&b.name.to_lowercase())
    });
}

/// Render mode bits the way `ls -l` does
pub fn format_mode(mode: u32, is_dir: bool) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFSOCK => 's',
        S_IFBLK => 'b',
        S_IFCHR => 'c',
        S_IFIFO => 'p',
        S_IFREG => '-',
        _ if is_dir => 'd',
        _ => '-',
    };

    let bit = |mask: u32, c: char| if mode & mask != 0 { c } else { '-' };
    let special = |exec: u32, flag: u32, set: char, unset: char| match (mode & exec != 0, mode & flag != 0) {
        (true, true) => set,
        (false, true) => unset,
        (true, false) => 'x',
        (false, false) => '-',
    };

    let mut text = String::with_capacity(10);
    text.push(kind);
    text.push(bit(0o400, 'r'));
    text.push(bit(0o200, 'w'));
    text.push(special(0o100, 0o4000, 's', 'S'));
    text.push(bit(0o040, 'r'));
    text.push(bit(0o020, 'w'));
    text.push(special(0o010, 0o2000, 's', 'S'));
    text.push(bit(0o004, 'r'));
    text.push(bit(0o002, 'w'));
    text.push(special(0o001, 0o1000, 't', 'T'));
    text
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Lifecycle of a single transfer
///
/// `Idle -> CheckResume -> Resume | Fresh -> Transferring -> Commit -> Done`,
/// with `Failed` reachable from CheckResume, Transferring and Commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    CheckResume,
    Resume,
    Fresh,
    Transferring,
    Commit,
    Done,
    Failed,
}

/// One upload or download, alive for the duration of the call
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub direction: TransferDirection,
    pub source_path: String,
    pub dest_path: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub chunk_size: usize,
    phase: TransferPhase,
}

impl TransferTask {
    pub fn new(
        direction: TransferDirection,
        source_path: impl Into<String>,
        dest_path: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            source_path: source_path.into(),
            dest_path: dest_path.into(),
            total_bytes: 0,
            transferred_bytes: 0,
            chunk_size: CHUNK_SIZE,
            phase: TransferPhase::Idle,
        }
    }

    /// Name the data is written to until commit
    pub fn temp_path(&self) -> String {
        format!("{}{}", self.dest_path, TEMP_SUFFIX)
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn enter(&mut self, phase: TransferPhase) {
        debug!(
            "{:?} {} -> {}: {:?} -> {:?} ({}/{} bytes)",
            self.direction,
            self.source_path,
            self.dest_path,
            self.phase,
            phase,
            self.transferred_bytes,
            self.total_bytes
        );
        self.phase = phase;
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes == self.total_bytes
    }
}

/// Result of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    /// Final size of the committed file
    pub bytes: u64,
    /// Offset the transfer continued from, 0 for a fresh one
    pub resumed_from: u64,
}
