#![forbid(unsafe_code)]
//! Database file framing: the header, read-only mapping and durable commits.
//!
//! The file is the committed [`Image`](crate::primitives::alloc::Image): a
//! 32-byte header followed by nodes addressed by their file offset. The
//! header keeps two top-ref slots; a commit writes the inactive slot, syncs,
//! then flips the selector, so a crash at any point leaves one valid root.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::types::{header_crc32, Ref, Result, StoreError};

/// Length of the file header; also the first valid node ref.
pub const FILE_HEADER_LEN: usize = 32;
/// Magic bytes identifying a database file.
pub const FILE_MAGIC: [u8; 4] = *b"CSDB";
/// Current file format version.
pub const FILE_FORMAT_VERSION: u16 = 1;

const TOP_REF_0: Range<usize> = 0..8;
const TOP_REF_1: Range<usize> = 8..16;
const MAGIC: Range<usize> = 16..20;
const FORMAT_VERSION: Range<usize> = 20..22;
const RESERVED: usize = 22;
const FLAGS: usize = 23;
const CRC32: Range<usize> = 24..28;
const RESERVED_2: Range<usize> = 28..32;
const CRC_COVERED: Range<usize> = 0..24;

const FLAG_SELECT: u8 = 0x01;

/// Decoded file header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
    /// Both top-ref slots.
    pub top_refs: [Ref; 2],
    /// Index of the live slot.
    pub select: usize,
    /// Format version found in the file.
    pub format_version: u16,
}

impl FileHeader {
    /// A header whose live slot holds `top`.
    pub fn new(top: Ref) -> Self {
        Self {
            top_refs: [top, Ref::NULL],
            select: 0,
            format_version: FILE_FORMAT_VERSION,
        }
    }

    /// The live top ref.
    pub fn top_ref(&self) -> Ref {
        self.top_refs[self.select]
    }

    /// Encodes the header into the first [`FILE_HEADER_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) {
        let hdr = &mut dst[..FILE_HEADER_LEN];
        hdr[TOP_REF_0].copy_from_slice(&self.top_refs[0].0.to_le_bytes());
        hdr[TOP_REF_1].copy_from_slice(&self.top_refs[1].0.to_le_bytes());
        hdr[MAGIC].copy_from_slice(&FILE_MAGIC);
        hdr[FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        hdr[RESERVED] = 0;
        hdr[FLAGS] = if self.select == 1 { FLAG_SELECT } else { 0 };
        let crc = header_crc32(&FILE_MAGIC, &hdr[CRC_COVERED]);
        hdr[CRC32].copy_from_slice(&crc.to_be_bytes());
        hdr[RESERVED_2].fill(0);
    }

    /// Decodes and validates a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(StoreError::InvalidDatabase("file shorter than header"));
        }
        let hdr = &src[..FILE_HEADER_LEN];
        if hdr[MAGIC] != FILE_MAGIC {
            return Err(StoreError::InvalidDatabase("bad file magic"));
        }
        let crc = u32::from_be_bytes(read_array(&hdr[CRC32]));
        if crc != header_crc32(&FILE_MAGIC, &hdr[CRC_COVERED]) {
            return Err(StoreError::InvalidDatabase("file header crc mismatch"));
        }
        let format_version = u16::from_be_bytes(read_array(&hdr[FORMAT_VERSION]));
        if format_version != FILE_FORMAT_VERSION {
            return Err(StoreError::InvalidDatabase("unsupported file format version"));
        }
        if hdr[RESERVED] != 0
            || hdr[FLAGS] & !FLAG_SELECT != 0
            || hdr[RESERVED_2].iter().any(|b| *b != 0)
        {
            return Err(StoreError::InvalidDatabase("file header reserved bits set"));
        }
        Ok(Self {
            top_refs: [
                Ref(u64::from_le_bytes(read_array(&hdr[TOP_REF_0]))),
                Ref(u64::from_le_bytes(read_array(&hdr[TOP_REF_1]))),
            ],
            select: usize::from(hdr[FLAGS] & FLAG_SELECT),
            format_version,
        })
    }

    fn staged(&self, top: Ref) -> Self {
        let mut next = self.clone();
        next.top_refs[1 - self.select] = top;
        next
    }

    fn flipped(&self) -> Self {
        let mut next = self.clone();
        next.select = 1 - self.select;
        next
    }
}

/// Reads the live top ref of a complete file image.
pub fn read_top_ref(bytes: &[u8]) -> Result<Ref> {
    Ok(FileHeader::decode(bytes)?.top_ref())
}

/// Builds a standalone file from a node image whose refs start at [`FILE_HEADER_LEN`].
pub fn assemble_file(top: Ref, nodes: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; FILE_HEADER_LEN];
    FileHeader::new(top).encode(&mut out);
    out.extend_from_slice(nodes);
    out
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// An open database file.
pub struct DbFile {
    io: Arc<dyn FileIo>,
    header: FileHeader,
    len: u64,
    sync: bool,
}

impl DbFile {
    /// Creates (or truncates) `path` holding an empty database.
    pub fn create(path: impl AsRef<Path>, sync: bool) -> Result<Self> {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path.as_ref(), OpenMode::Create)?);
        let header = FileHeader::new(Ref::NULL);
        let mut buf = [0u8; FILE_HEADER_LEN];
        header.encode(&mut buf);
        io.write_at(0, &buf)?;
        if sync {
            io.sync_all()?;
        }
        info!(target: "colstore::file", path = %path.as_ref().display(), "created database file");
        Ok(Self {
            io,
            header,
            len: FILE_HEADER_LEN as u64,
            sync,
        })
    }

    /// Opens an existing file and validates its header.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self> {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path.as_ref(), OpenMode::Existing)?);
        Self::from_io(io, sync)
    }

    /// Attaches to any [`FileIo`] holding a database.
    pub fn from_io(io: Arc<dyn FileIo>, sync: bool) -> Result<Self> {
        let len = io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            return Err(StoreError::InvalidDatabase("file shorter than header"));
        }
        if len % 8 != 0 {
            return Err(StoreError::InvalidDatabase("file length not 8-byte aligned"));
        }
        let mut buf = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut buf)?;
        let header = FileHeader::decode(&buf)?;
        if header.top_ref().0 >= len {
            return Err(StoreError::InvalidDatabase("top ref beyond end of file"));
        }
        Ok(Self {
            io,
            header,
            len,
            sync,
        })
    }

    /// Reads the whole file as immutable bytes.
    pub fn map_readonly(&self) -> Result<Arc<[u8]>> {
        let buf = self.io.read_all()?;
        if buf.len() as u64 != self.len {
            return Err(StoreError::InvalidDatabase("file length changed underneath the database"));
        }
        Ok(buf.into())
    }

    /// The live top ref.
    pub fn read_top_ref(&self) -> Ref {
        self.header.top_ref()
    }

    /// File length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true when the file holds only a header.
    pub fn is_empty(&self) -> bool {
        self.len <= FILE_HEADER_LEN as u64
    }

    /// Appends `bytes` at the end of the file and returns their offset.
    ///
    /// A failed write or sync truncates the file back to its previous length,
    /// so the file never carries a partial segment.
    pub fn append_and_fsync(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.len;
        if !bytes.is_empty() {
            let written = self.io.write_at(offset, bytes).and_then(|()| {
                if self.sync {
                    self.io.sync_all()
                } else {
                    Ok(())
                }
            });
            if let Err(err) = written {
                warn!(target: "colstore::file", offset, error = %err, "append failed; truncating");
                if let Err(cleanup) = self.io.truncate(offset) {
                    warn!(target: "colstore::file", offset, error = %cleanup, "truncate after failed append");
                }
                return Err(err);
            }
            self.len += bytes.len() as u64;
        }
        debug!(target: "colstore::file", offset, bytes = bytes.len(), "appended segment");
        Ok(offset)
    }

    /// Durably makes `top` the live root.
    pub fn commit_top_ref(&mut self, top: Ref) -> Result<()> {
        let staged = self.header.staged(top);
        self.write_header(&staged)?;
        let live = staged.flipped();
        self.write_header(&live)?;
        self.header = live;
        debug!(target: "colstore::file", top = top.0, slot = self.header.select, "committed top ref");
        Ok(())
    }

    fn write_header(&self, header: &FileHeader) -> Result<()> {
        let mut buf = [0u8; FILE_HEADER_LEN];
        header.encode(&mut buf);
        self.io.write_at(0, &buf)?;
        if self.sync {
            self.io.sync_all()?;
        }
        Ok(())
    }
}
