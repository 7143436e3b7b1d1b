use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 8; // start index, u64 LE
const FRAME_HEADER_SIZE: u64 = 8; // record length, u64 LE

/// An append-only file holding a contiguous run of log records.
///
/// Layout: the start index followed by `[len: u64 LE][record]` frames.
/// Frame offsets are rebuilt by scanning on open; a torn frame at the tail
/// is cut off.
#[derive(Debug)]
pub struct Segment {
    file: File,
    path: PathBuf,
    start_index: u64,
    offsets: Vec<u64>,
    len: u64,
}

fn invalid(path: &Path, reason: String) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("segment {}: {}", path.display(), reason),
    )
}

impl Segment {
    /// Opens or creates the segment at `path` whose first record has
    /// `start_index`.
    pub fn new<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            file.set_len(0)?;
            file.write_all(&start_index.to_le_bytes())?;
            file.sync_data()?;
        } else {
            let mut header = [0u8; HEADER_SIZE as usize];
            file.read_exact(&mut header)?;
            let stored = u64::from_le_bytes(header);
            if stored != start_index {
                return Err(invalid(
                    &path,
                    format!("starts at {}, expected {}", stored, start_index),
                ));
            }
        }

        let mut segment = Segment {
            file,
            path,
            start_index,
            offsets: Vec::new(),
            len: HEADER_SIZE,
        };
        segment.scan()?;
        Ok(segment)
    }

    fn scan(&mut self) -> io::Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;
        self.offsets.clear();

        while pos + FRAME_HEADER_SIZE <= file_len {
            self.file.seek(SeekFrom::Start(pos))?;
            let mut size = [0u8; FRAME_HEADER_SIZE as usize];
            self.file.read_exact(&mut size)?;
            let end = match (pos + FRAME_HEADER_SIZE).checked_add(u64::from_le_bytes(size)) {
                Some(end) if end <= file_len => end,
                _ => break,
            };
            self.offsets.push(pos);
            pos = end;
        }

        if pos < file_len {
            self.file.set_len(pos)?;
        }
        self.len = pos;
        Ok(())
    }

    pub fn append(&mut self, records: &[Vec<u8>]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        for record in records {
            self.file.write_all(&(record.len() as u64).to_le_bytes())?;
            self.file.write_all(record)?;
            self.offsets.push(self.len);
            self.len += FRAME_HEADER_SIZE + record.len() as u64;
        }
        self.file.sync_data()
    }

    pub fn read(&mut self, index: u64) -> io::Result<Vec<u8>> {
        let slot = index
            .checked_sub(self.start_index)
            .map(|slot| slot as usize)
            .filter(|slot| *slot < self.offsets.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("index {} not in segment {}", index, self.path.display()),
                )
            })?;

        let start = self.offsets[slot] + FRAME_HEADER_SIZE;
        let end = self.offsets.get(slot + 1).copied().unwrap_or(self.len);
        let mut record = vec![0u8; (end - start) as usize];
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut record)?;
        Ok(record)
    }

    /// Reads every record, in index order.
    pub fn read_all(&mut self) -> io::Result<Vec<Vec<u8>>> {
        (0..self.offsets.len() as u64)
            .map(|slot| self.read(self.start_index + slot))
            .collect()
    }

    /// Keeps records up to and including `index`.
    pub fn truncate_after(&mut self, index: u64) -> io::Result<()> {
        let keep = (index + 1).saturating_sub(self.start_index) as usize;
        if keep >= self.offsets.len() {
            return Ok(());
        }
        self.len = self.offsets[keep];
        self.offsets.truncate(keep);
        self.file.set_len(self.len)?;
        self.file.sync_data()
    }

    /// Deletes the segment file.
    pub fn remove(self) -> io::Result<()> {
        drop(self.file);
        fs::remove_file(self.path)
    }

    /// Index of the next record to be appended.
    pub fn next_index(&self) -> u64 {
        self.start_index + self.offsets.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn records(names: &[&str]) -> Vec<Vec<u8>> {
        names.iter().map(|n| n.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::new(dir.path().join("s.log"), 5).unwrap();
        assert_eq!(segment.next_index(), 5);

        segment.append(&records(&["five", "six"])).unwrap();
        segment.append(&records(&["seven"])).unwrap();
        assert_eq!(segment.next_index(), 8);
        assert_eq!(segment.read(6).unwrap(), b"six");
        assert!(segment.read(4).is_err());
        assert!(segment.read(8).is_err());
    }

    #[test]
    fn test_truncate_then_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.log");
        let mut segment = Segment::new(&path, 1).unwrap();
        segment.append(&records(&["a", "b", "c"])).unwrap();

        segment.truncate_after(1).unwrap();
        segment.append(&records(&["x"])).unwrap();
        assert_eq!(segment.read_all().unwrap(), records(&["a", "x"]));

        segment.truncate_after(0).unwrap();
        assert_eq!(segment.next_index(), 1);
        drop(segment);
        assert_eq!(Segment::new(&path, 1).unwrap().next_index(), 1);
    }

    #[test]
    fn test_reopen_drops_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.log");
        Segment::new(&path, 10)
            .unwrap()
            .append(&records(&["ten", "eleven"]))
            .unwrap();

        // A frame promising more bytes than were written.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u64.to_le_bytes()).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        let mut segment = Segment::new(&path, 10).unwrap();
        assert_eq!(segment.read_all().unwrap(), records(&["ten", "eleven"]));
        segment.append(&records(&["twelve"])).unwrap();
        assert_eq!(segment.read(12).unwrap(), b"twelve");
    }

    #[test]
    fn test_reopen_drops_garbage_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.log");
        Segment::new(&path, 1)
            .unwrap()
            .append(&records(&["one"]))
            .unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&u64::MAX.to_le_bytes()).unwrap();
        file.write_all(b"junk").unwrap();
        drop(file);

        let mut segment = Segment::new(&path, 1).unwrap();
        assert_eq!(segment.read_all().unwrap(), records(&["one"]));
        assert_eq!(segment.next_index(), 2);
    }

    #[test]
    fn test_wrong_start_index_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.log");
        Segment::new(&path, 1).unwrap();
        assert!(Segment::new(&path, 2).is_err());
    }
}
