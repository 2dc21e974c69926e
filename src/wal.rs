use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Written once at the start of every log file.
const MAGIC: &[u8; 8] = b"VNUBOOK1";

/// Larger length prefixes are treated as corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes of framing around each payload.
const FRAME_OVERHEAD: u64 = 8;

/// Encode one record as `[u32 len][bincode payload][u32 crc32]`.
fn encode_frame<R: Serialize>(writer: &mut impl Write, record: &R) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame and its size on disk. `Ok(None)` means a clean end, a torn
/// tail or a corrupt frame; replay stops there either way.
fn decode_frame<R: DeserializeOwned>(reader: &mut impl Read) -> io::Result<Option<(R, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|record| (record, len as u64 + FRAME_OVERHEAD)))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn open_for_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let fresh = file.metadata()?.len() == 0;
    let mut writer = BufWriter::new(file);
    if fresh {
        writer.write_all(MAGIC)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    Ok(writer)
}

/// Append-only write-ahead log of domain records.
///
/// Appends are buffered; `flush_sync` makes everything buffered so far durable,
/// which lets the writer task commit a whole batch with one fsync. A torn or
/// corrupt tail left by a crash is dropped on replay.
pub struct Wal<R> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(R)>,
}

impl<R: Serialize + DeserializeOwned> Wal<R> {
    /// Replay the log, cut off any torn or corrupt tail, and open it for
    /// appends. New records land directly after the last intact one.
    pub fn recover(path: &Path) -> io::Result<(Vec<R>, Self)> {
        let (records, valid_len) = Self::scan(path)?;
        if let Some(valid_len) = valid_len {
            let file = OpenOptions::new().write(true).open(path)?;
            if file.metadata()?.len() > valid_len {
                warn!(
                    "truncating {} to {valid_len} bytes after an unreadable tail",
                    path.display()
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }
        Ok((records, Self::open(path)?))
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: open_for_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Buffer one record without syncing.
    pub fn append_buffered(&mut self, record: &R) -> io::Result<()> {
        encode_frame(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &R) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Write a snapshot next to the log. Slow; no state lock should be held.
    pub fn write_snapshot(path: &Path, records: &[R]) -> io::Result<()> {
        let file = File::create(snapshot_path(path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        for record in records {
            encode_frame(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen it for appends.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(snapshot_path(&self.path), &self.path)?;
        self.writer = open_for_append(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record. A missing file replays as empty; a file that
    /// does not start with the log header is refused.
    pub fn replay(path: &Path) -> io::Result<Vec<R>> {
        Self::scan(path).map(|(records, _)| records)
    }

    /// Intact records plus the byte length they span, header included.
    /// The length is `None` when there is no log to speak of yet.
    fn scan(path: &Path) -> io::Result<(Vec<R>, Option<u64>)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
            Err(e) => return Err(e),
        };
        if file.metadata()?.len() == 0 {
            return Ok((Vec::new(), None));
        }
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; MAGIC.len()];
        if !read_or_eof(&mut reader, &mut magic)? || &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a venuebook log", path.display()),
            ));
        }

        let mut records = Vec::new();
        let mut valid_len = MAGIC.len() as u64;
        while let Some((record, size)) = decode_frame(&mut reader)? {
            records.push(record);
            valid_len += size;
        }
        Ok((records, Some(valid_len)))
    }
}

fn snapshot_path(path: &Path) -> PathBuf {
    path.with_extension("wal.snapshot")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DayCategory, Event, SlotKey, SlotTime};
    use chrono::NaiveDate;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("venuebook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn day_event(day: u32, limit: u32) -> Event {
        Event::DayCategorized {
            date: NaiveDate::from_ymd_opt(2025, 6, day).unwrap(),
            category: DayCategory::Limited,
            limit,
        }
    }

    fn slot_event(hour: u16, limit: Option<u32>) -> Event {
        Event::SlotLimitSet {
            slot: SlotKey::new(
                NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                SlotTime::from_hm(hour, 0).unwrap(),
            ),
            limit,
        }
    }

    #[test]
    fn append_and_replay_in_order() {
        let path = tmp_path("append_replay.wal");
        let events = vec![day_event(1, 20), slot_event(10, Some(5)), slot_event(10, None)];
        {
            let mut wal: Wal<Event> = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), events);
    }

    #[test]
    fn reopen_does_not_repeat_header() {
        let path = tmp_path("reopen.wal");
        {
            let mut wal: Wal<Event> = Wal::open(&path).unwrap();
            wal.append(&day_event(1, 10)).unwrap();
        }
        {
            let mut wal: Wal<Event> = Wal::open(&path).unwrap();
            wal.append(&day_event(2, 11)).unwrap();
        }
        let replayed = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replayed, vec![day_event(1, 10), day_event(2, 11)]);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        {
            let mut wal: Wal<Event> = Wal::open(&path).unwrap();
            wal.append(&day_event(1, 30)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0]).unwrap();
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), vec![day_event(1, 30)]);
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        {
            let mut wal: Wal<Event> = Wal::open(&path).unwrap();
            wal.append(&day_event(1, 30)).unwrap();
        }
        {
            let payload = bincode::serialize(&day_event(2, 40)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xBAD0_C0DEu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), vec![day_event(1, 30)]);
    }

    #[test]
    fn recover_cuts_torn_tail_before_new_appends() {
        let path = tmp_path("recover_torn.wal");
        {
            let mut wal: Wal<Event> = Wal::open(&path).unwrap();
            wal.append(&day_event(1, 30)).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0]).unwrap();
        }
        {
            let (records, mut wal) = Wal::<Event>::recover(&path).unwrap();
            assert_eq!(records, vec![day_event(1, 30)]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);
            wal.append(&day_event(2, 40)).unwrap();
        }
        let (records, _) = Wal::<Event>::recover(&path).unwrap();
        assert_eq!(records, vec![day_event(1, 30), day_event(2, 40)]);
    }

    #[test]
    fn oversized_length_prefix_stops_replay() {
        let path = tmp_path("huge_len.wal");
        {
            let mut wal: Wal<Event> = Wal::open(&path).unwrap();
            wal.append(&day_event(1, 30)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), vec![day_event(1, 30)]);
    }

    #[test]
    fn recover_fresh_file_writes_header() {
        let path = tmp_path("recover_fresh.wal");
        let (records, mut wal) = Wal::<Event>::recover(&path).unwrap();
        assert!(records.is_empty());
        wal.append(&day_event(4, 12)).unwrap();
        assert_eq!(Wal::<Event>::replay(&path).unwrap(), vec![day_event(4, 12)]);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::<Event>::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn foreign_file_is_refused() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"not a log at all").unwrap();
        let err = Wal::<Event>::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn snapshot_replaces_history_and_accepts_appends() {
        let path = tmp_path("snapshot.wal");
        let mut wal: Wal<Event> = Wal::open(&path).unwrap();
        for limit in 0..20 {
            wal.append(&slot_event(11, Some(limit))).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        assert_eq!(wal.appends_since_compact(), 20);

        let snapshot = vec![slot_event(11, Some(19))];
        Wal::write_snapshot(&path, &snapshot).unwrap();
        wal.install_snapshot().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        wal.append(&day_event(3, 7)).unwrap();
        let replayed = Wal::<Event>::replay(&path).unwrap();
        assert_eq!(replayed, vec![slot_event(11, Some(19)), day_event(3, 7)]);
    }
}
