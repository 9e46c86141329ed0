//! Fixed-size pages of the environment file.
//!
//! Page 0 holds the superblock. Page N holds node N, or nothing. Node pages
//! start with a [`PageHeader`] followed by the node image; the superblock
//! page has its own layout (see `superblock.rs`).

/// Page size in bytes (8KB).
pub const PAGE_SIZE: usize = 8192;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// A page number. Equal to the id of the node stored in it.
pub type PageId = u64;

/// First byte of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Superblock = 0x01,
    Internal = 0x03,
    Leaf = 0x04,
    /// Never written, or its node was deleted.
    Free = 0x06,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            // set_len extends the file with zeroes
            0x00 | 0x06 => Ok(Self::Free),
            0x01 => Ok(Self::Superblock),
            0x03 => Ok(Self::Internal),
            0x04 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// Header at the start of every node page.
///
/// ```text
/// 0      page_type
/// 1-3    reserved (zero)
/// 4-7    CRC32 of the page with this field zeroed
/// 8-11   payload_len, bytes of payload after the header
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub checksum: u32,
    pub payload_len: u32,
}

impl PageHeader {
    pub const SIZE: usize = 12;

    /// Bytes available after the header.
    pub const CAPACITY: usize = PAGE_SIZE - Self::SIZE;

    const CHECKSUM_AT: usize = 4;
    const PAYLOAD_LEN_AT: usize = 8;

    #[must_use]
    pub const fn new(page_type: PageType, payload_len: u32) -> Self {
        Self {
            page_type,
            checksum: 0,
            payload_len,
        }
    }

    /// Store the header at the start of `page`, leaving the checksum to
    /// [`Page::seal`].
    pub fn write_to(&self, page: &mut Page) {
        page.write_bytes(0, &[self.page_type as u8, 0, 0, 0]);
        page.write_u32(Self::CHECKSUM_AT, self.checksum);
        page.write_u32(Self::PAYLOAD_LEN_AT, self.payload_len);
    }

    /// Read the header stored at the start of `page`.
    pub fn read_from(page: &Page) -> Result<Self, PageError> {
        let page_type = PageType::try_from(page.as_bytes()[0]).map_err(PageError::InvalidPageType)?;
        let payload_len = page.read_u32(Self::PAYLOAD_LEN_AT);
        if payload_len as usize > Self::CAPACITY {
            return Err(PageError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            page_type,
            checksum: page.read_u32(Self::CHECKSUM_AT),
            payload_len,
        })
    }
}

/// A raw page buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// A zeroed page, which reads back as free.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Little-endian u32 at `offset`.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.array(offset))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Little-endian u64 at `offset`.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.array(offset))
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// The payload following a node page header.
    #[must_use]
    pub fn payload(&self, header: &PageHeader) -> &[u8] {
        self.read_bytes(PageHeader::SIZE, header.payload_len as usize)
    }

    /// Stamp the header checksum so that [`verify_checksum`](Self::verify_checksum)
    /// succeeds.
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.write_u32(PageHeader::CHECKSUM_AT, checksum);
    }

    pub fn verify_checksum(&self) -> Result<(), PageError> {
        let expected = self.read_u32(PageHeader::CHECKSUM_AT);
        let actual = self.compute_checksum();
        if expected == actual {
            Ok(())
        } else {
            Err(PageError::ChecksumMismatch { expected, actual })
        }
    }

    fn compute_checksum(&self) -> u32 {
        let checksum_end = PageHeader::CHECKSUM_AT + 4;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..PageHeader::CHECKSUM_AT]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.data[checksum_end..]);
        hasher.finalize()
    }

    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.data[offset..offset + N]);
        buf
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_type", &PageType::try_from(self.data[0]))
            .finish_non_exhaustive()
    }
}

/// Errors reading a node page header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    InvalidPageType(u8),
    /// Declared payload does not fit in a page.
    PayloadTooLarge(u32),
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(v) => write!(f, "invalid page type: 0x{v:02x}"),
            Self::PayloadTooLarge(len) => {
                write!(f, "payload of {len} bytes exceeds page capacity")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "page checksum mismatch: stored {expected:#010x}, computed {actual:#010x}")
            }
        }
    }
}

impl std::error::Error for PageError {}
