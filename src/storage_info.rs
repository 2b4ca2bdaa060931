//! Byte-to-piece and byte-to-file geometry for a torrent's on-disk layout.
//!
//! None of this module touches a filesystem; it only answers "which file(s)
//! back this piece" and "where in file X does torrent byte Y live", which is
//! what the disk IO layer and the piece bookkeeping need to translate wire
//! indices into actual reads and writes.

use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// A single file within a torrent, and where it sits in the torrent's
/// flattened byte space.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. Always 0 for a
    /// single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// The file's first and one-past-the-last byte offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Translates a torrent-wide byte offset and length into a slice
    /// relative to this file, clamping `len` to what's left in the file.
    ///
    /// # Panics
    ///
    /// Panics if `torrent_offset` falls outside this file's byte range;
    /// callers are expected to have located the file via
    /// [`FsStructure::files_intersecting_bytes`] first.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        let range = self.byte_range();
        assert!(
            range.contains(&torrent_offset),
            "torrent offset {} is outside file range {:?}",
            torrent_offset,
            range
        );
        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(range.end - torrent_offset),
        }
    }
}

/// A byte range local to a single file, as opposed to the torrent-wide
/// offsets [`FileInfo::byte_range`] deals in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    pub offset: u64,
    pub len: u64,
}

/// Piece and file geometry derived from a torrent's metainfo: piece count
/// and size, total download length, and where on disk it all goes.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    pub piece_count: usize,
    pub piece_len: u32,
    /// The length of the last piece, which is shorter than `piece_len`
    /// whenever the download length isn't an exact multiple of it.
    pub last_piece_len: u32,
    pub download_len: u64,
    /// For an archive download this is `download_dir` joined with the
    /// torrent's name, so that a torrent with multiple top-level entries
    /// doesn't scatter files across the caller's download directory.
    pub download_dir: PathBuf,
    pub structure: FsStructure,
}

impl StorageInfo {
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let piece_len = metainfo.piece_len;
        let download_len = metainfo.structure.download_len();
        let last_piece_len = (download_len - piece_len as u64 * (piece_count - 1) as u64) as u32;

        let download_dir = if metainfo.structure.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            structure: metainfo.structure.clone(),
        }
    }

    /// The zero-based, half-open range of file indices that the given piece
    /// overlaps.
    pub fn files_intersecting_piece(&self, index: PieceIndex) -> Result<Range<FileIndex>> {
        let piece_offset = index as u64 * self.piece_len as u64;
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.structure.files_intersecting_bytes(piece_offset..piece_end))
    }

    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index >= self.piece_count {
            log::error!("piece {} out of bounds for {} piece torrent", index, self.piece_count);
            return Err(Error::InvalidPieceIndex);
        }
        Ok(if index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        })
    }
}

/// The file system layout of a torrent's download.
#[derive(Clone, Debug)]
pub enum FsStructure {
    /// A single file download.
    File(FileInfo),
    /// Multiple files, possibly nested in directories, flattened into one
    /// list ordered by `torrent_offset`.
    Archive { files: Vec<FileInfo> },
}

impl FsStructure {
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// Total download size in bytes. For an archive this sums every file's
    /// length, so callers on a hot path should cache the result rather than
    /// call this repeatedly.
    pub fn download_len(&self) -> u64 {
        match self {
            Self::File(file) => file.len,
            Self::Archive { files } => files.iter().map(|f| f.len).sum(),
        }
    }

    /// Files overlapping the left-inclusive, right-exclusive byte range.
    ///
    /// Relies on `files` being sorted and laid edge-to-edge in torrent byte
    /// order (true of every [`FsStructure`] this crate constructs), which
    /// lets both boundaries be found with a binary search rather than a
    /// linear scan.
    pub fn files_intersecting_bytes(&self, byte_range: Range<u64>) -> Range<FileIndex> {
        match self {
            Self::File(_) => 0..1,
            Self::Archive { files } => {
                let start = files.partition_point(|f| f.torrent_end_offset() <= byte_range.start);
                if start >= files.len() || files[start].torrent_offset >= byte_range.end {
                    return 0..0;
                }
                let end = files.partition_point(|f| f.torrent_offset < byte_range.end);
                start..end
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_slice_clamps_to_remaining_file_length() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };

        assert_eq!(
            file.get_slice(300, 1000),
            FileSlice { offset: 100, len: 400 }
        );
        assert_eq!(file.get_slice(300, 10), FileSlice { offset: 100, len: 10 });
        assert_eq!(file.get_slice(200, 500), FileSlice { offset: 0, len: 500 });
    }

    #[test]
    #[should_panic]
    fn file_slice_before_file_start_panics() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        file.get_slice(100, 400);
    }

    #[test]
    #[should_panic]
    fn file_slice_past_file_end_panics() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        file.get_slice(700, 400);
    }

    fn archive(lens: &[u64]) -> FsStructure {
        let mut offset = 0;
        let files = lens
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                let file = FileInfo {
                    path: PathBuf::from(format!("/f{}", i)),
                    torrent_offset: offset,
                    len,
                };
                offset += len;
                file
            })
            .collect();
        FsStructure::Archive { files }
    }

    #[test]
    fn piece_len_reports_the_shorter_last_piece() {
        let info = StorageInfo {
            piece_count: 4,
            piece_len: 4,
            last_piece_len: 2,
            download_len: 3 * 4 + 2,
            download_dir: PathBuf::from("/"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("/bogus"),
                torrent_offset: 0,
                len: 14,
            }),
        };
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 4);
        assert_eq!(info.piece_len(3).unwrap(), 2);
        assert!(matches!(info.piece_len(4), Err(Error::InvalidPieceIndex)));
    }

    #[test]
    fn files_intersecting_piece_spans_multiple_files() {
        // file lengths: 9, 11, 7, 9, 12, 16, 8 laid edge to edge => offsets
        // 0, 9, 20, 27, 36, 48, 64 and piece boundaries every 16 bytes
        // (last piece is 8 bytes).
        let structure = archive(&[9, 11, 7, 9, 12, 16, 8]);
        let info = StorageInfo {
            piece_count: 5,
            piece_len: 16,
            last_piece_len: 8,
            download_len: 72,
            download_dir: PathBuf::from("/"),
            structure,
        };
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..4);
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 3..5);
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 5..6);
        assert_eq!(info.files_intersecting_piece(4).unwrap(), 6..7);
        assert!(info.files_intersecting_piece(5).is_err());
    }

    #[test]
    fn files_intersecting_bytes_single_file_always_returns_that_file() {
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("/bogus"),
            torrent_offset: 0,
            len: 12_341_234,
        });
        assert_eq!(structure.files_intersecting_bytes(0..0), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..12_341_234), 0..1);
    }

    #[test]
    fn files_intersecting_bytes_finds_boundary_overlaps() {
        let structure = archive(&[4, 9, 3, 10]);

        // entirely within the first file
        assert_eq!(structure.files_intersecting_bytes(0..4), 0..1);
        // crosses the boundary between files 0 and 1
        assert_eq!(structure.files_intersecting_bytes(0..5), 0..2);
        // touches all four files
        assert_eq!(structure.files_intersecting_bytes(0..18), 0..4);
        // last byte of the last file only
        assert_eq!(structure.files_intersecting_bytes(25..26), 3..4);
        // spans the two middle files
        assert_eq!(structure.files_intersecting_bytes(4..16), 1..3);
        // a single byte at the seam between files 2 and 3
        assert_eq!(structure.files_intersecting_bytes(13..14), 2..3);
        // past the end of every file
        assert_eq!(structure.files_intersecting_bytes(30..38), 0..0);
    }
}
