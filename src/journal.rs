//! Boot log capture for machines.
//!
//! A [`JournalFactory`] opens one [`Journal`] per machine inside the
//! machine's working directory. The default [`FileJournalFactory`] appends
//! captured log text to `journal.txt`.

use std::io::Write as _;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, OpenOptions};
use thiserror::Error;

/// File name of the journal capture inside a machine directory.
pub const JOURNAL_FILE_NAME: &str = "journal.txt";

/// Errors raised by journal sinks.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JournalError {
    /// Raised when the journal file cannot be opened or written.
    #[error("journal I/O failed for {path}: {message}")]
    Io {
        /// Path of the journal file.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when writing to a journal that was already destroyed.
    #[error("journal {path} already destroyed")]
    Destroyed {
        /// Path of the journal file.
        path: Utf8PathBuf,
    },
}

/// Sink capturing one machine's logs to disk.
pub trait Journal: Send + Sync {
    /// Appends captured log text.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the capture cannot be persisted.
    fn record(&self, text: &str) -> Result<(), JournalError>;

    /// Reads everything captured so far.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the capture cannot be read.
    fn read(&self) -> Result<Vec<u8>, JournalError>;

    /// Stops capturing. Captured data stays on disk; later calls are no-ops.
    fn destroy(&self);
}

/// Opens journal sinks for new machines.
pub trait JournalFactory: Send + Sync {
    /// Starts a journal inside `directory`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the sink cannot be created.
    fn new_journal(&self, directory: &Utf8Path) -> Result<Box<dyn Journal>, JournalError>;
}

/// Factory for [`FileJournal`] sinks.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileJournalFactory;

impl JournalFactory for FileJournalFactory {
    fn new_journal(&self, directory: &Utf8Path) -> Result<Box<dyn Journal>, JournalError> {
        Ok(Box::new(FileJournal::create(directory)?))
    }
}

/// Journal appending to `journal.txt` in a machine directory.
#[derive(Debug)]
pub struct FileJournal {
    dir: Dir,
    path: Utf8PathBuf,
    destroyed: Mutex<bool>,
}

impl FileJournal {
    /// Creates an empty journal file in `directory`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the directory cannot be opened or the
    /// file cannot be created.
    pub fn create(directory: &Utf8Path) -> Result<Self, JournalError> {
        let path = directory.join(JOURNAL_FILE_NAME);
        let io_err = |err: std::io::Error| JournalError::Io {
            path: path.clone(),
            message: err.to_string(),
        };
        let dir = Dir::open_ambient_dir(directory, ambient_authority()).map_err(io_err)?;
        dir.write(JOURNAL_FILE_NAME, b"").map_err(io_err)?;
        Ok(Self {
            dir,
            path,
            destroyed: Mutex::new(false),
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn io_error(&self, err: &std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

impl Journal for FileJournal {
    fn record(&self, text: &str) -> Result<(), JournalError> {
        let destroyed = self.destroyed.lock().unwrap_or_else(PoisonError::into_inner);
        if *destroyed {
            return Err(JournalError::Destroyed {
                path: self.path.clone(),
            });
        }
        let mut options = OpenOptions::new();
        options.append(true);
        let mut file = self
            .dir
            .open_with(JOURNAL_FILE_NAME, &options)
            .map_err(|err| self.io_error(&err))?;
        file.write_all(text.as_bytes())
            .map_err(|err| self.io_error(&err))
    }

    fn read(&self) -> Result<Vec<u8>, JournalError> {
        self.dir
            .read(JOURNAL_FILE_NAME)
            .map_err(|err| self.io_error(&err))
    }

    fn destroy(&self) {
        *self.destroyed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn temp_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
        (tmp, path)
    }

    #[rstest]
    fn records_are_appended_and_readable() {
        let (_tmp, dir) = temp_dir();
        let journal = FileJournalFactory.new_journal(&dir).expect("journal");
        journal.record("boot: ok\n").expect("first record");
        journal.record("sshd: listening\n").expect("second record");

        let bytes = journal.read().expect("read");
        assert_eq!(bytes, b"boot: ok\nsshd: listening\n");
        assert!(dir.join(JOURNAL_FILE_NAME).is_file());
    }

    #[rstest]
    fn destroy_stops_recording_but_keeps_capture() {
        let (_tmp, dir) = temp_dir();
        let journal = FileJournal::create(&dir).expect("journal");
        journal.record("before\n").expect("record");
        journal.destroy();
        journal.destroy();

        let err = journal.record("after\n").expect_err("destroyed journal");
        assert!(matches!(err, JournalError::Destroyed { .. }));
        assert_eq!(journal.read().expect("read"), b"before\n");
    }

    #[rstest]
    fn create_fails_for_missing_directory() {
        let (_tmp, dir) = temp_dir();
        let missing = dir.join("absent");
        let err = FileJournal::create(&missing).expect_err("missing dir");
        assert!(matches!(err, JournalError::Io { .. }));
    }
}
