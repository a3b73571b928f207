use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

/// Bytes around each payload: `u32` length prefix and `u32` CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single commit to [len][bincode][crc32] format, returning the
/// frame size.
fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<u64> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(FRAME_OVERHEAD + u64::from(len))
}

/// Test hook: make the next batch fail at a chosen point.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) enum Fault {
    /// After the first commit of the batch is buffered.
    Append,
    /// After the batch reached the file, in place of fsync.
    Sync,
}

#[cfg(test)]
fn trip(armed: Option<Fault>, at: Fault) -> io::Result<()> {
    match (armed, at) {
        (Some(Fault::Append), Fault::Append) | (Some(Fault::Sync), Fault::Sync) => {
            Err(io::Error::other(format!("injected {at:?} failure")))
        }
        _ => Ok(()),
    }
}

/// Append-only Write-Ahead Log of committed atomic units.
///
/// Format per entry: `[u32: len][bincode: Commit][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn trailing entry (crash mid-write) is discarded on replay and cut
///   off when the log is reopened, so a commit is replayed whole or not at all.
/// - A batch that fails to write or sync is cut back off the file before
///   anything else is appended. Callers were told it failed, so it must never
///   come back on replay.
pub struct Wal {
    /// `None` once a failed batch could not be cut back; every later append
    /// is refused until compaction rewrites the file.
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    /// File length covering exactly the commits that were synced.
    synced_len: u64,
    appends_since_compact: u64,
    #[cfg(test)]
    fault: Option<Fault>,
}

impl Wal {
    /// Replay the log at `path` and open it for appends, truncating any
    /// torn or corrupt tail so new frames follow the last good one.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Commit>)> {
        let (commits, valid_len) = read_valid(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                "dropping {} unreadable bytes from the tail of {}",
                on_disk - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: Some(BufWriter::new(file)),
            path: path.to_path_buf(),
            synced_len: valid_len,
            appends_since_compact: 0,
            #[cfg(test)]
            fault: None,
        };
        Ok((wal, commits))
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_batch([commit])
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// Write and fsync a batch of commits. On error the file is cut back to
    /// its length before the batch and nothing of the batch stays buffered.
    pub fn append_batch<'a>(&mut self, commits: impl IntoIterator<Item = &'a Commit>) -> io::Result<()> {
        match self.write_batch(commits) {
            Ok((frames, bytes)) => {
                self.synced_len += bytes;
                self.appends_since_compact += frames;
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = self.rollback() {
                    tracing::error!(
                        "could not cut failed batch off {}: {undo}; refusing appends until compaction",
                        self.path.display()
                    );
                }
                Err(e)
            }
        }
    }

    fn write_batch<'a>(&mut self, commits: impl IntoIterator<Item = &'a Commit>) -> io::Result<(u64, u64)> {
        #[cfg(test)]
        let fault = self.fault.take();
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("WAL unusable after a failed rollback"))?;

        let (mut frames, mut bytes) = (0, 0);
        for commit in commits {
            bytes += encode_commit(writer, commit)?;
            frames += 1;
            #[cfg(test)]
            trip(fault, Fault::Append)?;
        }
        writer.flush()?;
        #[cfg(test)]
        trip(fault, Fault::Sync)?;
        writer.get_ref().sync_all()?;
        Ok((frames, bytes))
    }

    /// Drop whatever the failed batch left buffered and truncate the file
    /// back to `synced_len`.
    fn rollback(&mut self) -> io::Result<()> {
        let Some(stale) = self.writer.take() else {
            return Ok(());
        };
        // into_parts hands the buffer back instead of flushing it
        let (file, _unwritten) = stale.into_parts();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file and fsync it.
    pub fn write_compact_file(path: &Path, commits: &[Commit]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for commit in commits {
            encode_commit(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp snapshot over the WAL and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Commit]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid commits.
    /// Truncated/corrupt trailing entries are silently discarded.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        read_valid(path).map(|(commits, _)| commits)
    }
}

/// Valid commits from the head of the log and the byte length they span.
fn read_valid(path: &Path) -> io::Result<(Vec<Commit>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut commits = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf);

        let mut payload = vec![0u8; len as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }

        let mut crc_buf = [0u8; 4];
        match reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            tracing::warn!("corrupt WAL entry in {}, stopping replay", path.display());
            break;
        }

        match bincode::deserialize::<Commit>(&payload) {
            Ok(commit) => commits.push(commit),
            Err(_) => break,
        }
        valid_len += FRAME_OVERHEAD + u64::from(len);
    }

    Ok((commits, valid_len))
}
