//! Environment file I/O operations.
//!
//! An environment is two files: the page file (`<name>.db`), where page 0 is
//! the superblock and page N holds node N, and the log (`<name>.log`) next to
//! it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::btree::{Node, NodeError, NodeId};
use crate::storage::io::{Storage, StorageError};
use crate::storage::page::{PAGE_SIZE_U64, Page, PageId, PageType};
use crate::storage::superblock::{Superblock, SuperblockError};

/// An environment file handle with node page I/O and the attached log.
pub struct EnvironmentFile {
    file: File,
    log: File,
    superblock: Superblock,
}

impl EnvironmentFile {
    /// Create a new environment at the given path.
    ///
    /// Returns an error if the page file already exists. An existing log is
    /// truncated.
    pub fn create(path: &Path) -> Result<Self, FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(FileError::Io)?;

        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(log_path(path))
            .map_err(FileError::Io)?;

        // Initialize with a fresh superblock
        let superblock = Superblock::new();
        file.write_all(superblock.to_page().as_bytes())
            .map_err(FileError::Io)?;
        file.sync_all().map_err(FileError::Io)?;
        log.sync_all().map_err(FileError::Io)?;

        Ok(Self {
            file,
            log,
            superblock,
        })
    }

    /// Open an existing environment.
    pub fn open(path: &Path) -> Result<Self, FileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(log_path(path))
            .map_err(FileError::Io)?;

        // Read and validate the superblock
        let mut page = Page::new();
        file.read_exact(page.as_bytes_mut()).map_err(FileError::Io)?;
        let mut superblock = Superblock::from_page(&page).map_err(FileError::Superblock)?;

        // Node pages written after the last superblock update still count.
        let pages_on_disk = file.metadata().map_err(FileError::Io)?.len() / PAGE_SIZE_U64;
        superblock.total_page_count = superblock.total_page_count.max(pages_on_disk);

        Ok(Self {
            file,
            log,
            superblock,
        })
    }

    /// Open the environment at `path`, creating it if it does not exist.
    pub fn open_or_create(path: &Path) -> Result<Self, FileError> {
        if path.exists() {
            Self::open(path)
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(FileError::Io)?;
            }
            Self::create(path)
        }
    }

    /// Get the total number of pages in the file.
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.superblock.total_page_count
    }

    /// Read a page from the file.
    ///
    /// Returns `None` if the page is past the end of the file.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Option<Page>, FileError> {
        if page_id >= self.superblock.total_page_count {
            return Ok(None);
        }

        let mut page = Page::new();
        self.file
            .seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))
            .map_err(FileError::Io)?;
        self.file
            .read_exact(page.as_bytes_mut())
            .map_err(FileError::Io)?;

        Ok(Some(page))
    }

    /// Write a page to the file, extending it when needed.
    pub fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), FileError> {
        if page_id == 0 {
            return Err(FileError::ReservedPage);
        }
        if page_id >= self.superblock.total_page_count {
            self.allocate_pages(page_id + 1 - self.superblock.total_page_count)?;
        }

        self.file
            .seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))
            .map_err(FileError::Io)?;
        self.file
            .write_all(page.as_bytes())
            .map_err(FileError::Io)?;

        Ok(())
    }

    /// Allocate new pages at the end of the file.
    ///
    /// Returns the page ID of the first allocated page.
    pub fn allocate_pages(&mut self, count: u64) -> Result<PageId, FileError> {
        let first_new_page = self.superblock.total_page_count;
        let new_total = first_new_page + count;

        self.file
            .set_len(new_total * PAGE_SIZE_U64)
            .map_err(FileError::Io)?;
        self.superblock.total_page_count = new_total;

        Ok(first_new_page)
    }

    /// Write the superblock to page 0.
    pub fn write_superblock(&mut self) -> Result<(), FileError> {
        let page = self.superblock.to_page();

        self.file.seek(SeekFrom::Start(0)).map_err(FileError::Io)?;
        self.file
            .write_all(page.as_bytes())
            .map_err(FileError::Io)?;

        Ok(())
    }

    /// Sync all pending page writes to disk.
    pub fn sync(&self) -> Result<(), FileError> {
        self.file.sync_all().map_err(FileError::Io)
    }
}

/// Path of the log belonging to the page file at `path`.
#[must_use]
pub fn log_path(path: &Path) -> PathBuf {
    path.with_extension("log")
}

/// Errors that can occur during file operations.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(PathBuf),
    /// Superblock error.
    Superblock(SuperblockError),
    /// Page 0 holds the superblock and cannot hold a node.
    ReservedPage,
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
            Self::ReservedPage => write!(f, "page 0 is reserved for the superblock"),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Superblock(e) => Some(e),
            Self::AlreadyExists(_) | Self::ReservedPage => None,
        }
    }
}

impl From<FileError> for StorageError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Io(io_err) => Self::Io(io_err),
            FileError::AlreadyExists(path) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", path.display()),
            )),
            FileError::Superblock(e) => Self::Superblock(e),
            FileError::ReservedPage => Self::Corruption("write to page 0".to_string()),
        }
    }
}

impl Storage for EnvironmentFile {
    type Log = File;

    fn read_node(&mut self, node_id: NodeId) -> Result<Option<Node>, StorageError> {
        if node_id == 0 {
            return Ok(None);
        }
        let Some(page) = self.read_page(node_id)? else {
            return Ok(None);
        };
        let node = Node::from_page(&page).map_err(|source| StorageError::Node { node_id, source })?;
        match node {
            Some(node) if node.id() != node_id => Err(StorageError::Node {
                node_id,
                source: NodeError::InvalidId,
            }),
            other => Ok(other),
        }
    }

    fn node_ids(&mut self) -> Result<Vec<NodeId>, StorageError> {
        let mut ids = Vec::new();
        let mut type_byte = [0u8; 1];
        for page_id in 1..self.superblock.total_page_count {
            self.file.seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))?;
            self.file.read_exact(&mut type_byte)?;
            match PageType::try_from(type_byte[0]) {
                Ok(PageType::Internal | PageType::Leaf) => ids.push(page_id),
                Ok(PageType::Free) => {}
                Ok(PageType::Superblock) | Err(_) => {
                    return Err(StorageError::Corruption(format!(
                        "page {page_id} has unexpected type byte 0x{:02x}",
                        type_byte[0]
                    )));
                }
            }
        }
        Ok(ids)
    }

    fn write_node(&mut self, node: &Node) -> Result<(), StorageError> {
        let mut page = Page::new();
        node.write_to_page(&mut page)
            .map_err(|source| StorageError::Node {
                node_id: node.id(),
                source,
            })?;
        Ok(self.write_page(node.id(), &page)?)
    }

    fn delete_node(&mut self, node_id: NodeId) -> Result<(), StorageError> {
        if node_id == 0 || node_id >= self.superblock.total_page_count {
            return Ok(());
        }
        // A zeroed page reads back as free.
        Ok(self.write_page(node_id, &Page::new())?)
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        Ok(Self::sync(self)?)
    }

    fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    fn write_superblock(&mut self) -> Result<(), StorageError> {
        Ok(Self::write_superblock(self)?)
    }

    fn log(&mut self) -> &mut File {
        &mut self.log
    }

    fn log_sync(&mut self) -> Result<(), StorageError> {
        self.log.sync_all()?;
        Ok(())
    }
}
