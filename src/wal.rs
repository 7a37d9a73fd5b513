use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single commit to [len][bincode][crc32] format.
fn encode_commit(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - One entry per commit: a multi-event commit (booking insert + unit flip)
///   is a single frame and therefore replays all-or-nothing.
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC
///   check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    commits_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            commits_since_compact: 0,
        })
    }

    /// Append a single commit to the WAL and fsync. Used by tests only —
    /// production code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Append a single commit to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered
    /// entries.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        encode_commit(&mut self.writer, events)?;
        self.commits_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Return the WAL file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a compacted snapshot to a temp file and fsync. Each record's
    /// events form one commit so a torn rewrite never half-restores a record.
    /// This is the slow I/O phase — call OUTSIDE the WAL lock.
    pub fn write_compact_file(path: &Path, commits: &[Vec<Event>]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for commit in commits {
            encode_commit(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    /// This is fast — call while holding the WAL lock.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.commits_since_compact = 0;
        Ok(())
    }

    /// Replace the WAL with a minimal set of commits that recreates the
    /// current state. Convenience method that does both phases. Used by tests.
    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Vec<Event>]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }

    pub fn commits_since_compact(&self) -> u64 {
        self.commits_since_compact
    }

    /// Replay the WAL from disk, returning all valid commits in append order.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Vec<Event>>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();

        loop {
            // Read length prefix
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            // Read payload
            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            // Read CRC
            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            let computed_crc = crc32fast::hash(&payload);

            if stored_crc != computed_crc {
                // Corrupt entry — stop replaying
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(events) => commits.push(events),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UnitStatus, Event};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("stowage_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn unit_created(id: Ulid) -> Event {
        Event::UnitCreated {
            id,
            warehouse_id: Ulid::new(),
            unit_number: "A-1".into(),
            capacity_kg: 100,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let first = vec![unit_created(Ulid::new())];
        let second = vec![Event::TenantCreated {
            id: Ulid::new(),
            company_name: "Acme Logistics".into(),
            contact_email: "ops@acme.test".into(),
        }];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], first);
        assert_eq!(replayed[1], second);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn multi_event_commit_is_one_frame() {
        let path = tmp_path("multi_event_commit.wal");
        let _ = fs::remove_file(&path);

        let unit_id = Ulid::new();
        let commit = vec![
            unit_created(unit_id),
            Event::UnitUpdated {
                id: unit_id,
                capacity_kg: 100,
                status: UnitStatus::Occupied,
                version: 1,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&commit).unwrap();
            assert_eq!(wal.commits_since_compact(), 1);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].len(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let commit = vec![unit_created(Ulid::new())];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&commit).unwrap();
        }

        // Append garbage to simulate a truncated second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0], commit);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let commit = vec![unit_created(Ulid::new())];

        // Manually write an entry with bad CRC
        {
            let payload = bincode::serialize(&commit).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_commit_discarded_whole() {
        let path = tmp_path("torn_commit.wal");
        let _ = fs::remove_file(&path);

        let intact = vec![unit_created(Ulid::new())];
        let unit_id = Ulid::new();
        let torn = vec![
            unit_created(unit_id),
            Event::UnitUpdated {
                id: unit_id,
                capacity_kg: 100,
                status: UnitStatus::Occupied,
                version: 1,
            },
        ];

        // Write one intact frame, then a torn two-event frame (payload cut
        // short). Neither event of the torn commit may survive replay.
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&intact).unwrap();
        }
        {
            let payload = bincode::serialize(&torn).unwrap();
            let len = payload.len() as u32;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload[..payload.len() / 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![intact]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let _ = fs::remove_file(&path);

        let unit_id = Ulid::new();
        let warehouse_id = Ulid::new();

        // Write many churn events: create, then repeated status flips
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&[Event::UnitCreated {
                id: unit_id,
                warehouse_id,
                unit_number: "B-7".into(),
                capacity_kg: 250,
            }])
            .unwrap();
            for v in 1..=20u64 {
                let status = if v % 2 == 0 { UnitStatus::Available } else { UnitStatus::Occupied };
                wal.append(&[Event::UnitUpdated {
                    id: unit_id,
                    capacity_kg: 250,
                    status,
                    version: v,
                }])
                .unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        assert!(before > 0);

        // Compact: final state is one create + one update
        let compacted: Vec<Vec<Event>> = vec![vec![
            Event::UnitCreated {
                id: unit_id,
                warehouse_id,
                unit_number: "B-7".into(),
                capacity_kg: 250,
            },
            Event::UnitUpdated {
                id: unit_id,
                capacity_kg: 250,
                status: UnitStatus::Available,
                version: 20,
            },
        ]];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let unit_id = Ulid::new();
        let compacted: Vec<Vec<Event>> = vec![vec![unit_created(unit_id)]];

        let new_commit = vec![Event::UnitUpdated {
            id: unit_id,
            capacity_kg: 100,
            status: UnitStatus::Occupied,
            version: 1,
        }];

        {
            let mut wal = Wal::open(&path).unwrap();
            // Seed some data
            wal.append(&compacted[0]).unwrap();
            // Compact
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.commits_since_compact(), 0);
            // Append new commit after compaction
            wal.append(&new_commit).unwrap();
            assert_eq!(wal.commits_since_compact(), 1);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], compacted[0]);
        assert_eq!(replayed[1], new_commit);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let commits: Vec<Vec<Event>> =
            (0..5).map(|_| vec![unit_created(Ulid::new())]).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.commits_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, commits);

        let _ = fs::remove_file(&path);
    }
}
