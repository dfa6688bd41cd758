//! Consolidated artifact layout.
//!
//! ```text
//! [magic "CAIRN\0SV"][version u32]
//! [u64 len][player-identity block]
//! [u16 segment][u64 len][active segment]
//! [u64 len][world block]
//! [u16 segment][u64 len][segment] ...   zero or more, ascending
//! [u16 0xFFFF]
//! [BLAKE3 digest of every preceding byte, 32 bytes]
//! ```
//!
//! Lengths are exact, so a reader can skip any record without decoding it.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cairn_world::segment::SegmentNumber;
use cairn_world::state::WorldState;

use crate::codec::{measure, Encode, PlayerBlock};
use crate::sink::Sink;
use crate::RestoreError;

pub const MAGIC: [u8; 8] = *b"CAIRN\0SV";
pub const FORMAT_VERSION: u32 = 1;
/// Record tag that ends the record list.
pub const EOF_TAG: u16 = 0xFFFF;
pub const DIGEST_LEN: usize = 32;
/// Magic plus version.
pub const HEADER_LEN: u64 = 12;
/// End tag plus digest.
const TRAILER_LEN: u64 = 2 + DIGEST_LEN as u64;

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Everything before the consolidated records: header, player block, active
/// segment record and world block. Encoded in one two-pass write.
pub struct ArtifactPrefix<'a> {
    pub player: &'a PlayerBlock,
    pub world: &'a WorldState,
}

impl Encode for ArtifactPrefix<'_> {
    fn encode<S: Sink>(&self, sink: &mut S) {
        sink.put(&MAGIC);
        sink.put_u32(FORMAT_VERSION);

        sink.put_u64(measure(self.player));
        self.player.encode(sink);

        let active = &self.world.active;
        sink.put_u16(active.number.0);
        sink.put_u64(measure(active));
        active.encode(sink);

        sink.put_u64(measure(self.world));
        self.world.encode(sink);
    }
}

/// Append a `[tag][len][payload]` record.
pub fn write_record<W: Write>(out: &mut W, number: SegmentNumber, payload: &[u8]) -> io::Result<()> {
    out.write_all(&number.0.to_le_bytes())?;
    out.write_all(&(payload.len() as u64).to_le_bytes())?;
    out.write_all(payload)
}

/// Hashes everything written through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: blake3::Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            written: 0,
        }
    }

    /// The inner writer, the digest so far and the byte count.
    pub fn finish(self) -> (W, blake3::Hash, u64) {
        (self.inner, self.hasher.finalize(), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

fn io_error<'a>(
    op: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> RestoreError + 'a {
    move |source| RestoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Sequential reader that hashes what it reads, for restore.
pub struct ArtifactReader {
    path: PathBuf,
    inner: BufReader<File>,
    hasher: blake3::Hasher,
    offset: u64,
    len: u64,
}

impl ArtifactReader {
    pub fn open(path: &Path) -> Result<Self, RestoreError> {
        let file = File::open(path).map_err(io_error("open", path))?;
        let len = file.metadata().map_err(io_error("stat", path))?.len();
        if len < HEADER_LEN + TRAILER_LEN {
            return Err(RestoreError::corrupt(format!(
                "{} is {len} bytes, too short to be an artifact",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            inner: BufReader::new(file),
            hasher: blake3::Hasher::new(),
            offset: 0,
            len,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes left before the trailer.
    fn body_remaining(&self) -> u64 {
        self.len.saturating_sub(self.offset + TRAILER_LEN)
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<(), RestoreError> {
        match self.inner.read_exact(buf) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(RestoreError::corrupt(format!(
                    "artifact truncated at offset {}",
                    self.offset
                )))
            }
            Err(error) => return Err(io_error("read", &self.path)(error)),
        }
        self.hasher.update(buf);
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn u16(&mut self) -> Result<u16, RestoreError> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, RestoreError> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn payload(&mut self, what: &str) -> Result<Vec<u8>, RestoreError> {
        let at = self.offset;
        let len = self.u64()?;
        if len > self.body_remaining() {
            return Err(RestoreError::corrupt(format!(
                "{what} at offset {at} claims {len} bytes, only {} remain",
                self.body_remaining()
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    /// Check magic and version.
    pub fn read_header(&mut self) -> Result<(), RestoreError> {
        let mut magic = [0u8; 8];
        self.fill(&mut magic)?;
        if magic != MAGIC {
            return Err(RestoreError::corrupt("bad magic; not a cairn artifact"));
        }
        let mut version = [0u8; 4];
        self.fill(&mut version)?;
        let version = u32::from_le_bytes(version);
        if version != FORMAT_VERSION {
            return Err(RestoreError::corrupt(format!(
                "unsupported format version {version}, expected {FORMAT_VERSION}"
            )));
        }
        Ok(())
    }

    /// A `[u64 len][payload]` block.
    pub fn read_block(&mut self, what: &str) -> Result<Vec<u8>, RestoreError> {
        self.payload(what)
    }

    /// The next `[tag][len][payload]` record, or `None` at the end tag.
    pub fn next_record(&mut self) -> Result<Option<(SegmentNumber, Vec<u8>)>, RestoreError> {
        let at = self.offset;
        let tag = self.u16()?;
        if tag == EOF_TAG {
            return Ok(None);
        }
        let number = SegmentNumber(tag);
        if !number.is_valid() {
            return Err(RestoreError::corrupt(format!(
                "invalid segment tag {tag} at offset {at}"
            )));
        }
        let payload = self.payload("segment record")?;
        Ok(Some((number, payload)))
    }

    /// Verify the digest after the end tag and that nothing follows it.
    /// Returns the digest.
    pub fn finish(mut self) -> Result<blake3::Hash, RestoreError> {
        let computed = self.hasher.finalize();
        let mut stored = [0u8; DIGEST_LEN];
        match self.inner.read_exact(&mut stored) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(RestoreError::corrupt("artifact digest is missing"))
            }
            Err(error) => return Err(io_error("read", &self.path)(error)),
        }
        if blake3::Hash::from(stored) != computed {
            return Err(RestoreError::corrupt(format!(
                "digest mismatch: recorded {} but computed {}",
                blake3::Hash::from(stored).to_hex(),
                computed.to_hex()
            )));
        }
        let mut probe = [0u8; 1];
        match self.inner.read(&mut probe) {
            Ok(0) => Ok(computed),
            Ok(_) => Err(RestoreError::corrupt("trailing bytes after the digest")),
            Err(error) => Err(io_error("read", &self.path)(error)),
        }
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Where one segment record lives inside an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordEntry {
    pub segment: SegmentNumber,
    /// Offset of the payload (past tag and length).
    pub offset: u64,
    pub len: u64,
    /// Whether this is the active segment record.
    pub active: bool,
}

/// Record positions of a committed artifact, found by skipping over
/// payloads by their lengths. Nothing is decoded and the digest is not
/// checked; only the framing is.
#[derive(Debug, Clone)]
pub struct ArtifactIndex {
    path: PathBuf,
    records: Vec<RecordEntry>,
}

/// Forward-only cursor used by [`ArtifactIndex::scan`].
struct Scanner<'a> {
    path: &'a Path,
    reader: BufReader<File>,
    pos: u64,
    len: u64,
}

impl Scanner<'_> {
    fn exact<const N: usize>(&mut self) -> Result<[u8; N], RestoreError> {
        let mut buf = [0u8; N];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(RestoreError::corrupt(format!(
                    "artifact framing truncated at offset {}",
                    self.pos
                )))
            }
            Err(error) => return Err(io_error("read", self.path)(error)),
        }
        self.pos += N as u64;
        Ok(buf)
    }

    fn u16(&mut self) -> Result<u16, RestoreError> {
        Ok(u16::from_le_bytes(self.exact()?))
    }

    fn u64(&mut self) -> Result<u64, RestoreError> {
        Ok(u64::from_le_bytes(self.exact()?))
    }

    /// Skip `n` payload bytes, which must end before the trailer.
    fn skip(&mut self, n: u64) -> Result<(), RestoreError> {
        if self.pos.saturating_add(n).saturating_add(TRAILER_LEN) > self.len {
            return Err(RestoreError::corrupt(format!(
                "record at offset {} runs past the end of the artifact",
                self.pos
            )));
        }
        self.reader
            .seek(SeekFrom::Current(n as i64))
            .map_err(io_error("seek", self.path))?;
        self.pos += n;
        Ok(())
    }

    /// `[len][payload]` after a tag that has already been read.
    fn record(&mut self, tag: u16, active: bool) -> Result<RecordEntry, RestoreError> {
        let segment = SegmentNumber(tag);
        if !segment.is_valid() {
            return Err(RestoreError::corrupt(format!(
                "invalid segment tag {tag} at offset {}",
                self.pos - 2
            )));
        }
        let len = self.u64()?;
        let entry = RecordEntry {
            segment,
            offset: self.pos,
            len,
            active,
        };
        self.skip(len)?;
        Ok(entry)
    }
}

impl ArtifactIndex {
    pub fn scan(path: &Path) -> Result<Self, RestoreError> {
        let file = File::open(path).map_err(io_error("open", path))?;
        let len = file.metadata().map_err(io_error("stat", path))?.len();
        let mut scan = Scanner {
            path,
            reader: BufReader::new(file),
            pos: 0,
            len,
        };

        let magic: [u8; 8] = scan.exact()?;
        if magic != MAGIC {
            return Err(RestoreError::corrupt("bad magic; not a cairn artifact"));
        }
        let version = u32::from_le_bytes(scan.exact()?);
        if version != FORMAT_VERSION {
            return Err(RestoreError::corrupt(format!(
                "unsupported format version {version}, expected {FORMAT_VERSION}"
            )));
        }

        // Player block.
        let player_len = scan.u64()?;
        scan.skip(player_len)?;

        // Active segment record, then the world block.
        let mut records = Vec::new();
        let tag = scan.u16()?;
        records.push(scan.record(tag, true)?);
        let world_len = scan.u64()?;
        scan.skip(world_len)?;

        loop {
            let tag = scan.u16()?;
            if tag == EOF_TAG {
                break;
            }
            records.push(scan.record(tag, false)?);
        }

        if scan.pos + DIGEST_LEN as u64 != len {
            return Err(RestoreError::corrupt(format!(
                "end tag at offset {} but artifact is {len} bytes",
                scan.pos - 2
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[RecordEntry] {
        &self.records
    }

    /// The segment that was active when the artifact was written.
    pub fn active(&self) -> Option<SegmentNumber> {
        self.records.iter().find(|r| r.active).map(|r| r.segment)
    }

    pub fn entry(&self, segment: SegmentNumber) -> Option<RecordEntry> {
        self.records.iter().copied().find(|r| r.segment == segment)
    }

    /// Read the raw payload of `segment`'s record, if the artifact has one.
    pub fn read_segment(&self, segment: SegmentNumber) -> Result<Option<Vec<u8>>, RestoreError> {
        let Some(entry) = self.entry(segment) else {
            return Ok(None);
        };
        let mut file = File::open(&self.path).map_err(io_error("open", &self.path))?;
        file.seek(SeekFrom::Start(entry.offset))
            .map_err(io_error("seek", &self.path))?;
        let mut buf = vec![0u8; entry.len as usize];
        file.read_exact(&mut buf).map_err(io_error("read", &self.path))?;
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::to_bytes;
    use cairn_world::entity::{Avatar, Position};
    use cairn_world::identity::Identity;
    use cairn_world::segment::Segment;
    use cairn_world::terrain::{TerrainGrid, Tile};

    fn world() -> WorldState {
        let mut avatar = Avatar::new(Identity::new(1).unwrap(), "wanderer");
        avatar.position = Some(Position::new(1, 1));
        let segment = Segment::new(SegmentNumber(2), TerrainGrid::filled(5, 5, Tile::Floor));
        let mut state = WorldState::new(9, avatar, segment);
        state.turn = 4;
        state
    }

    /// Write a complete artifact with `extra` records and return its bytes.
    fn write_artifact(path: &Path, extra: &[(u16, &[u8])]) -> Vec<u8> {
        let state = world();
        let player = PlayerBlock {
            avatar: state.avatar.id,
            name: state.avatar.name.clone(),
            high_water: 2,
            seed: state.seed,
            turn: state.turn,
        };
        let mut out = HashingWriter::new(Vec::new());
        out.write_all(&to_bytes(&ArtifactPrefix {
            player: &player,
            world: &state,
        }))
        .unwrap();
        for (tag, payload) in extra {
            write_record(&mut out, SegmentNumber(*tag), payload).unwrap();
        }
        out.write_all(&EOF_TAG.to_le_bytes()).unwrap();
        let (mut bytes, digest, written) = out.finish();
        assert_eq!(written, bytes.len() as u64);
        bytes.extend_from_slice(digest.as_bytes());
        std::fs::write(path, &bytes).unwrap();
        bytes
    }

    #[test]
    fn index_finds_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cairn.sav");
        write_artifact(&path, &[(1, b"one"), (5, b"fivefive")]);

        let index = ArtifactIndex::scan(&path).unwrap();
        let segments: Vec<u16> = index.records().iter().map(|r| r.segment.0).collect();
        assert_eq!(segments, vec![2, 1, 5]);
        assert_eq!(index.active(), Some(SegmentNumber(2)));
        assert_eq!(
            index.read_segment(SegmentNumber(5)).unwrap().as_deref(),
            Some(&b"fivefive"[..])
        );
        assert!(index.read_segment(SegmentNumber(3)).unwrap().is_none());
    }

    #[test]
    fn reader_walks_layout_and_checks_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cairn.sav");
        let bytes = write_artifact(&path, &[(3, b"three")]);

        let mut reader = ArtifactReader::open(&path).unwrap();
        reader.read_header().unwrap();
        reader.read_block("player block").unwrap();
        let (active, _) = reader.next_record().unwrap().unwrap();
        assert_eq!(active, SegmentNumber(2));
        reader.read_block("world block").unwrap();
        let (number, payload) = reader.next_record().unwrap().unwrap();
        assert_eq!((number, payload.as_slice()), (SegmentNumber(3), &b"three"[..]));
        assert!(reader.next_record().unwrap().is_none());
        let digest = reader.finish().unwrap();
        assert_eq!(digest.as_bytes(), &bytes[bytes.len() - DIGEST_LEN..]);
    }

    #[test]
    fn flipped_byte_fails_the_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cairn.sav");
        let mut bytes = write_artifact(&path, &[(3, b"three")]);
        let at = bytes.len() - DIGEST_LEN - 4;
        bytes[at] ^= 0x40;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = ArtifactReader::open(&path).unwrap();
        reader.read_header().unwrap();
        reader.read_block("player block").unwrap();
        reader.next_record().unwrap();
        reader.read_block("world block").unwrap();
        reader.next_record().unwrap();
        reader.next_record().unwrap();
        let err = reader.finish().unwrap_err();
        assert!(matches!(err, RestoreError::Corrupt { .. }));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cairn.sav");
        let mut bytes = write_artifact(&path, &[]);
        bytes[0] = b'X';
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            ArtifactIndex::scan(&path),
            Err(RestoreError::Corrupt { .. })
        ));
        let mut reader = ArtifactReader::open(&path).unwrap();
        assert!(reader.read_header().is_err());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cairn.sav");
        let bytes = write_artifact(&path, &[(3, b"three")]);
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert!(ArtifactIndex::scan(&path).is_err());
        std::fs::write(&path, &bytes[..8]).unwrap();
        assert!(ArtifactReader::open(&path).is_err());
    }
}
