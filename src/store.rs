use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;

/// Why an artifact was written. Encoded as the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Original bytes, kept because scoring failed.
    Unmodified,
    /// Processed body that could not be forwarded.
    ForwardFailed,
    /// Archival copy of a filtered message that was still forwarded.
    Filtered,
    /// Message dropped at the kill level, kept only when configured.
    Killed,
}

impl Disposition {
    pub fn extension(self) -> &'static str {
        match self {
            Disposition::Unmodified => ".eml",
            Disposition::ForwardFailed => ".txt",
            Disposition::Filtered => ".saved",
            Disposition::Killed => ".killed",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Disposition::Unmodified => "unmodified",
            Disposition::ForwardFailed => "forward-failed",
            Disposition::Filtered => "filtered",
            Disposition::Killed => "killed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    pub date_prefix: String,
    pub sequence: u64,
    pub disposition: Disposition,
    pub path: PathBuf,
}

impl StoreRecord {
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}{}",
            self.date_prefix,
            self.sequence,
            self.disposition.extension()
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to scan store directory {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug)]
struct SequenceState {
    date_prefix: String,
    next: u64,
}

/// On-disk message store. File names are `<YYYYMMDD>_<sequence><ext>`,
/// with sequence numbers unique and increasing within a day.
#[derive(Debug)]
pub struct Store {
    directory: PathBuf,
    state: Mutex<SequenceState>,
}

/// Local calendar date used as the file name prefix.
pub fn date_prefix() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

impl Store {
    /// Creates the directory if needed and resumes today's sequence one past
    /// the highest number already on disk.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        create_directory(&directory)?;

        let prefix = date_prefix();
        let next = recover_sequence(&directory, &prefix)?;
        log::info!(
            "Message store at {} resuming {} at sequence {}",
            directory.display(),
            prefix,
            next
        );

        Ok(Store {
            directory,
            state: Mutex::new(SequenceState {
                date_prefix: prefix,
                next,
            }),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn persist(
        &self,
        data: &[u8],
        disposition: Disposition,
    ) -> Result<StoreRecord, StoreError> {
        self.persist_dated(&date_prefix(), data, disposition).await
    }

    async fn persist_dated(
        &self,
        today: &str,
        data: &[u8],
        disposition: Disposition,
    ) -> Result<StoreRecord, StoreError> {
        loop {
            let (date_prefix, sequence) = self.assign(today);
            let record = StoreRecord {
                path: PathBuf::new(),
                date_prefix,
                sequence,
                disposition,
            };
            let path = self.directory.join(record.file_name());

            // The lock only covers numbering; names are unique so writes overlap.
            if !self.directory.is_dir() {
                create_directory(&self.directory)?;
            }
            match write_new(&path, data).await {
                Ok(()) => {
                    log::debug!("Stored {} bytes as {}", data.len(), path.display());
                    return Ok(StoreRecord { path, ..record });
                }
                // Another process sharing the directory, or a file left from
                // before a day rollover. The next assignment is already past it.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    log::warn!(
                        "{} already exists, retrying with sequence {}",
                        path.display(),
                        sequence + 1
                    );
                }
                Err(source) => return Err(StoreError::Write { path, source }),
            }
        }
    }

    fn assign(&self, today: &str) -> (String, u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.date_prefix != today {
            state.date_prefix = today.to_string();
            state.next = 0;
        }
        let sequence = state.next;
        state.next += 1;
        (state.date_prefix.clone(), sequence)
    }
}

async fn write_new(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.write_all(b"\r\n").await?;
    file.flush().await?;
    Ok(())
}

fn create_directory(directory: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(directory).map_err(|source| StoreError::CreateDir {
        path: directory.to_path_buf(),
        source,
    })
}

fn recover_sequence(directory: &Path, prefix: &str) -> Result<u64, StoreError> {
    let entries = std::fs::read_dir(directory).map_err(|source| StoreError::Scan {
        path: directory.to_path_buf(),
        source,
    })?;

    let marker = format!("{prefix}_");
    let highest = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| {
            let rest = name.strip_prefix(&marker)?;
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u64>().ok()
        })
        .max();

    Ok(highest.map_or(0, |n| n + 1))
}
