//! The append-only log file.
//!
//! One [`WriteAheadLog`] owns the log file of a data directory. Appends are
//! serialized by an internal mutex and fsynced before they return; replay
//! reads through a separate handle; checkpoints rewrite the file atomically.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::concept::now_micros;
use crate::error::WalError;
use crate::store::sync_parent_dir;

use super::frame::{self, FrameRead, WAL_MAGIC};
use super::{Operation, SequenceNumber, WalEntry, WalResult};

/// Summary of a replay pass, available once the iterator is exhausted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    /// Entries yielded to the caller.
    pub yielded: u64,
    /// Entries skipped because they precede the requested sequence.
    pub skipped: u64,
    /// Byte offset and reason of a discarded tail, if any.
    pub corrupt_tail: Option<(u64, String)>,
}

struct WalWriter {
    file: File,
    /// Length of the valid prefix; appends start here.
    len: u64,
    last_seq: SequenceNumber,
    poisoned: bool,
}

/// Durable, append-only operation log.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    /// Tail discarded while opening, reported once through recovery.
    discarded_tail: Option<(u64, String)>,
}

impl WriteAheadLog {
    /// Open or create the log at `path`.
    ///
    /// Scans the existing frames to find the last valid sequence. A torn or
    /// corrupt tail is cut off so new appends never follow garbage.
    pub fn open(path: &Path) -> WalResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| WalError::Io { source: e })?;

        let file_len = file.metadata().map_err(|e| WalError::Io { source: e })?.len();

        if file_len < WAL_MAGIC.len() as u64 {
            // New file, or a crash while writing the magic.
            file.set_len(0).map_err(|e| WalError::Io { source: e })?;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| WalError::Io { source: e })?;
            file.write_all(WAL_MAGIC)
                .map_err(|e| WalError::Io { source: e })?;
            file.sync_all().map_err(|e| WalError::Io { source: e })?;
            sync_parent_dir(path).map_err(|e| WalError::Io { source: e })?;
            tracing::debug!(path = %path.display(), "created write-ahead log");
            return Ok(Self {
                path: path.to_path_buf(),
                writer: Mutex::new(WalWriter {
                    file,
                    len: WAL_MAGIC.len() as u64,
                    last_seq: 0,
                    poisoned: false,
                }),
                discarded_tail: None,
            });
        }

        let scan = scan(path)?;
        let mut discarded_tail = None;
        if scan.valid_len < file_len {
            let reason = scan
                .torn_reason
                .unwrap_or_else(|| "trailing bytes after last frame".to_string());
            tracing::warn!(
                path = %path.display(),
                offset = scan.valid_len,
                discarded_bytes = file_len - scan.valid_len,
                %reason,
                "discarding corrupt WAL tail"
            );
            file.set_len(scan.valid_len)
                .map_err(|e| WalError::Io { source: e })?;
            file.sync_all().map_err(|e| WalError::Io { source: e })?;
            discarded_tail = Some((scan.valid_len, reason));
        }
        file.seek(SeekFrom::Start(scan.valid_len))
            .map_err(|e| WalError::Io { source: e })?;

        tracing::debug!(
            path = %path.display(),
            entries = scan.entries,
            last_seq = scan.last_seq,
            "opened write-ahead log"
        );

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                file,
                len: scan.valid_len,
                last_seq: scan.last_seq,
                poisoned: false,
            }),
            discarded_tail,
        })
    }

    /// Durably append an operation and return its sequence number.
    pub fn append(&self, op: Operation) -> WalResult<SequenceNumber> {
        self.append_entry(op).map(|entry| entry.seq)
    }

    /// Durably append an operation and return the full entry as logged.
    ///
    /// The frame is fsynced before this returns. On failure the file is cut
    /// back to its previous length; if that fails too the log is poisoned.
    pub fn append_entry(&self, op: Operation) -> WalResult<WalEntry> {
        let mut w = self.lock()?;
        if w.poisoned {
            return Err(WalError::Poisoned);
        }

        let entry = WalEntry {
            seq: w.last_seq + 1,
            timestamp: now_micros(),
            op,
        };
        let bytes = frame::encode(&entry)?;
        let start = w.len;

        let written = w
            .file
            .write_all(&bytes)
            .and_then(|_| w.file.sync_data());
        if let Err(source) = written {
            let rollback = w
                .file
                .set_len(start)
                .and_then(|_| w.file.seek(SeekFrom::Start(start)).map(|_| ()));
            if let Err(e) = rollback {
                tracing::error!(error = %e, "failed to roll back torn WAL append; log poisoned");
                w.poisoned = true;
            }
            return Err(WalError::Io { source });
        }

        w.len += bytes.len() as u64;
        w.last_seq = entry.seq;
        Ok(entry)
    }

    /// Lazily replay entries with `seq >= from` in sequence order.
    pub fn replay(&self, from: SequenceNumber) -> WalResult<WalReplay> {
        WalReplay::open(&self.path, from)
    }

    /// Drop every entry up to and including `up_to`.
    ///
    /// Only valid once the state through `up_to` is durably in a snapshot.
    /// The rewritten log starts with a `Checkpoint` marker carrying `up_to`,
    /// followed by the retained newer entries.
    pub fn checkpoint(&self, up_to: SequenceNumber) -> WalResult<()> {
        let mut w = self.lock()?;
        if w.poisoned {
            return Err(WalError::Poisoned);
        }
        if up_to > w.last_seq {
            return Err(WalError::InvalidCheckpoint {
                up_to,
                last: w.last_seq,
            });
        }

        let mut retained = Vec::new();
        let mut replay = WalReplay::open(&self.path, up_to + 1)?;
        for entry in replay.by_ref() {
            retained.push(entry?);
        }

        let marker = WalEntry {
            seq: up_to,
            timestamp: now_micros(),
            op: Operation::Checkpoint { up_to },
        };
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(WAL_MAGIC);
        buf.extend_from_slice(&frame::encode(&marker)?);
        for entry in &retained {
            buf.extend_from_slice(&frame::encode(entry)?);
        }

        let tmp = self.path.with_extension("log.tmp");
        {
            let mut f = File::create(&tmp).map_err(|e| WalError::Io { source: e })?;
            f.write_all(&buf).map_err(|e| WalError::Io { source: e })?;
            f.sync_all().map_err(|e| WalError::Io { source: e })?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| WalError::Io { source: e })?;

        // From here on the writer's handle points at the unlinked old file.
        let reopened = sync_parent_dir(&self.path).and_then(|()| {
            let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            file.seek(SeekFrom::End(0))?;
            Ok(file)
        });
        adopt_rewritten(&mut w, reopened, buf.len() as u64)?;
        tracing::debug!(up_to, retained = retained.len(), bytes = w.len, "WAL checkpointed");
        Ok(())
    }

    /// Raise the sequence counter so the next append is above `floor`.
    ///
    /// Used when a snapshot is newer than anything left in the log.
    pub fn ensure_sequence_floor(&self, floor: SequenceNumber) -> WalResult<()> {
        let mut w = self.lock()?;
        if w.last_seq < floor {
            w.last_seq = floor;
        }
        Ok(())
    }

    /// Sequence number of the most recent entry (0 if none).
    pub fn last_sequence(&self) -> SequenceNumber {
        self.lock().map(|w| w.last_seq).unwrap_or(0)
    }

    /// Current size of the log file in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.lock().map(|w| w.len).unwrap_or(0)
    }

    /// Whether a failed append left the log unusable.
    pub fn is_poisoned(&self) -> bool {
        self.lock().map(|w| w.poisoned).unwrap_or(true)
    }

    /// Tail that was discarded when the log was opened.
    pub fn discarded_tail(&self) -> Option<&(u64, String)> {
        self.discarded_tail.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point the writer at another handle, to inject I/O failures.
    #[cfg(test)]
    pub(crate) fn swap_handle(&self, file: File) {
        self.writer.lock().expect("wal writer lock poisoned").file = file;
    }

    fn lock(&self) -> WalResult<MutexGuard<'_, WalWriter>> {
        self.writer.lock().map_err(|_| WalError::Poisoned)
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("last_seq", &self.last_sequence())
            .finish()
    }
}

/// Switch the writer to the rewritten log file.
///
/// Without the new handle, appends would land in the replaced file and be
/// lost on restart, so a failure poisons the log.
fn adopt_rewritten(w: &mut WalWriter, reopened: std::io::Result<File>, len: u64) -> WalResult<()> {
    match reopened {
        Ok(file) => {
            w.file = file;
            w.len = len;
            Ok(())
        }
        Err(source) => {
            tracing::error!(error = %source, "rewritten WAL could not be reopened; log poisoned");
            w.poisoned = true;
            Err(WalError::Io { source })
        }
    }
}

/// Lazy, consume-once iterator over log entries.
///
/// Stops at the first torn or corrupt frame; the discarded tail is logged
/// and recorded in [`WalReplay::report`].
pub struct WalReplay {
    reader: BufReader<File>,
    from: SequenceNumber,
    offset: u64,
    done: bool,
    report: ReplayReport,
}

impl WalReplay {
    fn open(path: &Path, from: SequenceNumber) -> WalResult<Self> {
        let file = File::open(path).map_err(|e| WalError::Io { source: e })?;
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 8];
        let mut done = false;
        match reader.read_exact(&mut magic) {
            Ok(()) if &magic == WAL_MAGIC => {}
            Ok(()) => {
                return Err(WalError::BadMagic {
                    path: path.display().to_string(),
                });
            }
            // Shorter than the magic: an empty log.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => done = true,
            Err(e) => return Err(WalError::Io { source: e }),
        }
        Ok(Self {
            reader,
            from,
            offset: WAL_MAGIC.len() as u64,
            done,
            report: ReplayReport::default(),
        })
    }

    /// Counters for the entries read so far.
    pub fn report(&self) -> &ReplayReport {
        &self.report
    }
}

impl Iterator for WalReplay {
    type Item = WalResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match frame::read_frame(&mut self.reader) {
                Ok(FrameRead::Entry { entry, len }) => {
                    self.offset += len;
                    if entry.seq < self.from {
                        self.report.skipped += 1;
                        continue;
                    }
                    self.report.yielded += 1;
                    return Some(Ok(entry));
                }
                Ok(FrameRead::End) => self.done = true,
                Ok(FrameRead::Torn { reason }) => {
                    let err = WalError::CorruptEntry {
                        offset: self.offset,
                        reason: reason.clone(),
                    };
                    tracing::warn!(error = %err, "stopping WAL replay at corrupt entry");
                    self.report.corrupt_tail = Some((self.offset, reason));
                    self.done = true;
                }
                Err(source) => {
                    self.done = true;
                    return Some(Err(WalError::Io { source }));
                }
            }
        }
        None
    }
}

struct ScanResult {
    valid_len: u64,
    last_seq: SequenceNumber,
    entries: u64,
    torn_reason: Option<String>,
}

fn scan(path: &Path) -> WalResult<ScanResult> {
    let mut replay = WalReplay::open(path, 0)?;
    let mut last_seq = 0;
    let mut entries = 0;
    for entry in replay.by_ref() {
        let entry = entry?;
        last_seq = entry.seq;
        entries += 1;
    }
    Ok(ScanResult {
        valid_len: replay.offset,
        last_seq,
        entries,
        torn_reason: replay.report.corrupt_tail.map(|(_, reason)| reason),
    })
}
