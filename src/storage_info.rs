//! Maps torrent-relative byte ranges to the files they intersect, so the
//! piece manager's disk writer can target real multi-file archives as well
//! as single-file torrents.

use std::{ops::Range, path::PathBuf};

use crate::{FileIndex, PieceIndex, TorrentDescriptor};

/// Information about one of a torrent's files, as laid out on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's path, relative to the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files are
    /// viewed as a single contiguous byte array. Always 0 for single-file
    /// torrents.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// The range of torrent-relative byte offsets this file occupies.
    fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_offset + self.len
    }

    /// Returns the slice of this file that overlaps the range starting at
    /// `torrent_offset`, clamped to the file's length.
    ///
    /// # Panics
    ///
    /// Panics if `torrent_offset` falls outside this file's range.
    pub fn slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(
            torrent_offset >= self.torrent_offset,
            "torrent offset must be at or after file offset"
        );
        assert!(
            torrent_offset < self.torrent_offset + self.len,
            "torrent offset must be before file end offset"
        );
        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(self.torrent_offset + self.len - torrent_offset),
        }
    }
}

/// The location of a range of bytes within a single file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileSlice {
    /// The byte offset within the file.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Resolves which file(s) a piece or arbitrary byte range intersects.
///
/// A flat file list is enough here since this engine never resumes or
/// seeds existing downloads.
#[derive(Clone, Debug)]
pub struct FileLayout {
    files: Vec<FileInfo>,
}

impl FileLayout {
    /// Builds the layout from a torrent descriptor's ordered file list.
    pub fn new(descriptor: &TorrentDescriptor) -> Self {
        let mut offset = 0;
        let files = descriptor
            .files
            .iter()
            .map(|f| {
                let info = FileInfo {
                    path: f.path.clone(),
                    len: f.length,
                    torrent_offset: offset,
                };
                offset += f.length;
                info
            })
            .collect();
        Self { files }
    }

    /// The files making up the torrent, in order.
    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    /// Returns the left-inclusive range of file indices that intersect the
    /// given torrent-relative byte range.
    pub fn files_intersecting(&self, byte_range: Range<u64>) -> Range<FileIndex> {
        if self.files.len() == 1 {
            return 0..1;
        }

        let first = self
            .files
            .iter()
            .position(|f| f.byte_range().contains(&byte_range.start));
        let first = match first {
            Some(i) => i,
            None => return 0..0,
        };

        let mut end = first + 1;
        for (i, file) in self.files.iter().enumerate().skip(first + 1) {
            if !byte_range.contains(&file.torrent_offset) {
                break;
            }
            end = i + 1;
        }
        first..end
    }

    /// Returns the range of file indices that intersect the piece at
    /// `index`, given the torrent's nominal piece length and the piece's
    /// actual length (which may be shorter for the last piece).
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
        piece_length: u32,
        piece_len: u32,
    ) -> Range<FileIndex> {
        let start = index as u64 * piece_length as u64;
        let end = start + piece_len as u64;
        self.files_intersecting(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::TorrentFile;

    fn descriptor_with_files(files: Vec<(&str, u64)>) -> TorrentDescriptor {
        TorrentDescriptor {
            info_hash: [0; 20],
            piece_length: 16,
            piece_hashes: vec![[0; 20]],
            files: files
                .into_iter()
                .map(|(path, length)| TorrentFile {
                    path: PathBuf::from(path),
                    length,
                })
                .collect(),
            announce: "http://test".into(),
        }
    }

    #[test]
    fn test_single_file_always_intersects_file_zero() {
        let descriptor = descriptor_with_files(vec![("only.bin", 12341234)]);
        let layout = FileLayout::new(&descriptor);
        assert_eq!(layout.files_intersecting(0..0), 0..1);
        assert_eq!(layout.files_intersecting(0..1), 0..1);
        assert_eq!(layout.files_intersecting(0..12341234), 0..1);
    }

    #[test]
    fn test_multi_file_intersections() {
        let descriptor = descriptor_with_files(vec![
            ("f0", 4),
            ("f1", 9),
            ("f2", 3),
            ("f3", 10),
        ]);
        let layout = FileLayout::new(&descriptor);

        assert_eq!(layout.files_intersecting(0..4), 0..1);
        assert_eq!(layout.files_intersecting(0..5), 0..2);
        assert_eq!(layout.files_intersecting(0..13), 0..2);
        assert_eq!(layout.files_intersecting(0..15), 0..3);
        assert_eq!(layout.files_intersecting(0..18), 0..4);
        assert_eq!(layout.files_intersecting(25..26), 3..4);
        assert_eq!(layout.files_intersecting(4..16), 1..3);
        assert_eq!(layout.files_intersecting(30..38), 0..0);
    }

    #[test]
    fn test_file_slice_clamps_to_file_length() {
        let file = FileInfo {
            path: PathBuf::from("f"),
            len: 500,
            torrent_offset: 200,
        };
        assert_eq!(
            file.slice(300, 1000),
            FileSlice { offset: 100, len: 400 }
        );
        assert_eq!(file.slice(300, 10), FileSlice { offset: 100, len: 10 });
        assert_eq!(file.slice(200, 500), FileSlice { offset: 0, len: 500 });
    }

    #[test]
    #[should_panic]
    fn test_file_slice_before_file_panics() {
        let file = FileInfo {
            path: PathBuf::from("f"),
            len: 500,
            torrent_offset: 200,
        };
        file.slice(100, 400);
    }
}
