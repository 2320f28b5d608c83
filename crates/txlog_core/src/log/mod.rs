//! Log files: channels, naming, the active file with rotation, and pruning.

mod channel;
mod file;
mod files;
mod pruning;

pub use channel::{
    LogVersionBridge, NoNextVersion, PhysicalWritableChannel, ReadAheadChannel, SharedBackend,
};
pub use file::{LogFile, LogWriter, WriterMark};
pub use files::{LogFiles, ReaderLogVersionBridge, ShutdownMarker};
pub use pruning::{LogFileInformation, LogPruneStrategy};
