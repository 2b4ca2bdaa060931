use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::sync::RwLock;
use tokio::task;

use crate::collab::DiskIo;
use crate::error::{Error, Result};
use crate::storage_info::{FileInfo, FsStructure, StorageInfo};
use crate::{block_count, FileIndex, PieceIndex, Sha1Hash, TorrentId};

/// The disk collaborator backing [`DiskIo`]: one entry per registered
/// torrent, each owning its opened file handles and in-progress piece
/// write buffers.
///
/// Unlike the full download engine this crate's peer subsystem was lifted
/// out of, there is no separate command/alert channel here: the protocol
/// engine already runs each peer on its own task and awaits `DiskIo`
/// directly, so the extra indirection of a dedicated disk task would only
/// add a hop without adding concurrency.
#[derive(Default)]
pub(crate) struct Disk {
    torrents: RwLock<HashMap<TorrentId, TorrentDisk>>,
}

impl Disk {
    pub(crate) fn new() -> Self {
        Self {
            torrents: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a torrent, creating its download directory and opening (or
    /// creating) its file handles.
    pub(crate) async fn add_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
    ) -> Result<()> {
        let torrent = task::spawn_blocking(move || TorrentDisk::new(info, piece_hashes))
            .await
            .expect("disk setup task panicked")?;
        self.torrents.write().await.insert(id, torrent);
        Ok(())
    }

    async fn with_torrent<T>(
        &self,
        id: TorrentId,
        f: impl FnOnce(&TorrentDisk) -> Result<T>,
    ) -> Result<T> {
        let torrents = self.torrents.read().await;
        let torrent = torrents.get(&id).ok_or_else(|| {
            log::warn!("torrent {} not registered with disk", id);
            Error::InvalidTorrentId
        })?;
        f(torrent)
    }
}

#[async_trait]
impl DiskIo for Disk {
    async fn io_read(
        &self,
        torrent: TorrentId,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>> {
        self.with_torrent(torrent, |t| t.read_block(piece, offset, length))
            .await
    }

    async fn io_write(
        &self,
        torrent: TorrentId,
        piece: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        let data = data.to_vec();
        self.with_torrent(torrent, |t| t.enqueue_block(piece, offset, data))
            .await
    }

    async fn io_hash(&self, torrent: TorrentId, piece: PieceIndex) -> Result<bool> {
        let done = self
            .with_torrent(torrent, |t| Ok(t.take_if_complete(piece)))
            .await?;
        let (piece_buf, expected_hash) = match done {
            Some(pair) => pair,
            None => return Ok(false),
        };
        let piece_buf = Arc::new(piece_buf);
        let piece_buf_for_hash = Arc::clone(&piece_buf);
        let is_valid = task::spawn_blocking(move || piece_buf_for_hash.matches_hash(&expected_hash))
            .await
            .expect("piece hashing task panicked");

        if is_valid {
            self.with_torrent(torrent, |t| t.write_piece_to_disk(piece, &piece_buf))
                .await?;
        } else {
            log::warn!("piece {} failed hash verification", piece);
        }
        Ok(is_valid)
    }
}

/// A torrent's storage layout, expected piece hashes, open file handles and
/// in-progress piece write buffers.
struct TorrentDisk {
    info: StorageInfo,
    piece_hashes: Vec<Sha1Hash>,
    files: Vec<Mutex<File>>,
    pieces: Mutex<HashMap<PieceIndex, Piece>>,
}

impl TorrentDisk {
    fn new(info: StorageInfo, piece_hashes: Vec<Sha1Hash>) -> Result<Self> {
        let files = open_files(&info)?;
        Ok(Self {
            info,
            piece_hashes,
            files,
            pieces: Mutex::new(HashMap::new()),
        })
    }

    fn read_block(&self, piece: PieceIndex, offset: u32, length: u32) -> Result<Vec<u8>> {
        let piece_len = self.info.piece_len(piece)?;
        if offset + length > piece_len {
            return Err(Error::InvalidPieceIndex);
        }
        let torrent_offset = piece as u64 * self.info.piece_len as u64 + offset as u64;
        let files = self
            .info
            .files_intersecting_piece(piece)?;
        let mut out = vec![0u8; length as usize];
        self.read_range(torrent_offset, &mut out, files)?;
        Ok(out)
    }

    fn read_range(
        &self,
        torrent_offset: u64,
        out: &mut [u8],
        files: Range<FileIndex>,
    ) -> Result<()> {
        let mut written = 0usize;
        let mut torrent_offset = torrent_offset;
        for file_index in files {
            if written == out.len() {
                break;
            }
            let file_info = file_info_at(&self.info.structure, file_index);
            if torrent_offset < file_info.torrent_offset
                || torrent_offset >= file_info.torrent_end_offset()
            {
                continue;
            }
            let slice = file_info.get_slice(torrent_offset, (out.len() - written) as u64);
            let mut file = self.files[file_index]
                .lock()
                .expect("file handle mutex poisoned");
            file.seek(SeekFrom::Start(slice.offset))?;
            let end = written + slice.len as usize;
            file.read_exact(&mut out[written..end])?;
            written = end;
            torrent_offset += slice.len;
        }
        Ok(())
    }

    /// Places `data` into the piece's write buffer, starting a new buffer if
    /// this is its first block.
    fn enqueue_block(&self, piece_index: PieceIndex, offset: u32, data: Vec<u8>) -> Result<()> {
        if piece_index >= self.piece_hashes.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let piece_len = self.info.piece_len(piece_index)?;
        let mut pieces = self.pieces.lock().expect("piece map mutex poisoned");
        let piece = pieces.entry(piece_index).or_insert_with(|| Piece {
            len: piece_len,
            blocks: BTreeMap::new(),
        });
        if piece.blocks.contains_key(&offset) {
            log::warn!("duplicate block at piece {} offset {}", piece_index, offset);
        } else {
            piece.blocks.insert(offset, data);
        }
        Ok(())
    }

    /// Removes and returns the piece's write buffer along with its expected
    /// hash if every block has arrived; leaves it in place (and returns
    /// `None`) otherwise.
    fn take_if_complete(&self, piece_index: PieceIndex) -> Option<(Piece, Sha1Hash)> {
        let mut pieces = self.pieces.lock().expect("piece map mutex poisoned");
        let is_complete = pieces
            .get(&piece_index)
            .map(|p| p.blocks.len() == block_count(p.len))
            .unwrap_or(false);
        if !is_complete {
            return None;
        }
        let piece = pieces.remove(&piece_index)?;
        let expected_hash = *self.piece_hashes.get(piece_index)?;
        Some((piece, expected_hash))
    }

    fn write_piece_to_disk(&self, piece_index: PieceIndex, piece: &Piece) -> Result<()> {
        let torrent_offset = piece_index as u64 * self.info.piece_len as u64;
        let files = self.info.files_intersecting_piece(piece_index)?;
        let mut torrent_offset = torrent_offset;
        let mut blocks = piece.blocks.values();
        let mut current = blocks.next();
        let mut current_pos = 0usize;

        for file_index in files {
            let file_info = file_info_at(&self.info.structure, file_index);
            let mut file = self.files[file_index]
                .lock()
                .expect("file handle mutex poisoned");
            let slice = file_info.get_slice(torrent_offset, piece.len as u64);
            file.seek(SeekFrom::Start(slice.offset))?;

            let mut remaining = slice.len as usize;
            while remaining > 0 {
                let block = match current {
                    Some(b) => b,
                    None => break,
                };
                let available = block.len() - current_pos;
                let n = available.min(remaining);
                file.write_all(&block[current_pos..current_pos + n])?;
                remaining -= n;
                current_pos += n;
                if current_pos == block.len() {
                    current = blocks.next();
                    current_pos = 0;
                }
            }
            torrent_offset += slice.len;
        }
        Ok(())
    }
}

fn file_info_at(structure: &FsStructure, index: FileIndex) -> &FileInfo {
    match structure {
        FsStructure::File(file) => {
            debug_assert_eq!(index, 0);
            file
        }
        FsStructure::Archive { files } => &files[index],
    }
}

fn open_files(info: &StorageInfo) -> Result<Vec<Mutex<File>>> {
    fs::create_dir_all(&info.download_dir)?;
    match &info.structure {
        FsStructure::File(file) => {
            let path = info.download_dir.join(&file.path);
            let handle = OpenOptions::new().create(true).read(true).write(true).open(path)?;
            Ok(vec![Mutex::new(handle)])
        }
        FsStructure::Archive { files } => {
            let mut handles = Vec::with_capacity(files.len());
            for file in files {
                let path = info.download_dir.join(&file.path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let handle = OpenOptions::new().create(true).read(true).write(true).open(path)?;
                handles.push(Mutex::new(handle));
            }
            Ok(handles)
        }
    }
}

/// An in-progress piece's write buffer: the blocks received so far, keyed by
/// their offset within the piece so they hash and write out in order.
struct Piece {
    len: u32,
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl Piece {
    /// Hashes the piece's blocks in offset order and compares against
    /// `expected`.
    ///
    /// # Important
    ///
    /// This is a long-running, CPU-bound call and must be run on a
    /// blocking-friendly executor thread, not the async reactor.
    fn matches_hash(&self, expected: &Sha1Hash) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let digest = hasher.finalize();
        digest.as_slice() == expected
    }
}
