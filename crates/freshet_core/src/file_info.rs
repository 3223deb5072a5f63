use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::predicate::{AttrValue, AttributeEntry};

/// Attribute every file carries: its relative path as a string.
pub const NAME_ATTRIBUTE: &str = "name";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("archive path is empty")]
    Empty,
    #[error("archive path {0:?} is not relative")]
    NotRelative(String),
    #[error("archive path {0:?} contains an invalid component")]
    InvalidComponent(String),
}

/// A validated relative pathname inside an archive. Components are
/// separated by '/' on every platform; ordering is lexicographic, which
/// fixes the iteration order of multi-file piece sets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchivePath(String);

impl ArchivePath {
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();
        if path.is_empty() {
            return Err(PathError::Empty);
        }
        if path.starts_with('/') {
            return Err(PathError::NotRelative(path));
        }
        for component in path.split('/') {
            if component.is_empty()
                || component == "."
                || component == ".."
                || component.contains('\\')
                || component.contains('\0')
            {
                return Err(PathError::InvalidComponent(path));
            }
        }
        Ok(ArchivePath(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The on-disk location under an archive root.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for component in self.0.split('/') {
            out.push(component);
        }
        out
    }

    /// The hidden sidecar holding piece completeness for an in-progress file.
    pub fn sidecar_file_name(&self) -> String {
        let (dir, name) = match self.0.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, self.0.as_str()),
        };
        match dir {
            Some(dir) => format!("{dir}/.{name}.pieces"),
            None => format!(".{name}.pieces"),
        }
    }
}

impl std::fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a file: its archive path plus the attribute map derived
/// from it. Only the path travels on the wire; attributes are rebuilt on
/// the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId {
    path: ArchivePath,
}

impl FileId {
    pub fn new(path: ArchivePath) -> Self {
        FileId { path }
    }

    pub fn path(&self) -> &ArchivePath {
        &self.path
    }

    pub fn attribute_entries(&self) -> Vec<AttributeEntry> {
        vec![AttributeEntry::new(
            NAME_ATTRIBUTE,
            AttrValue::Str(self.path.as_str().to_owned()),
        )]
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.path.fmt(f)
    }
}

/// Witness that a piece index was validated against a file's piece count.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValidPieceIndex(u32);

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Immutable description of one replicated file: identity, total size,
/// piece size and a time-to-live hint.
///
/// A zero-length file has zero pieces and is complete the moment it is
/// registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileInfo {
    id: FileId,
    size: u64,
    piece_size: u32,
    ttl_seconds: u32,
}

impl FileInfo {
    pub fn new(id: FileId, size: u64, piece_size: u32, ttl_seconds: u32) -> anyhow::Result<Self> {
        if piece_size == 0 {
            anyhow::bail!("piece size of {} must be non-zero", id);
        }
        let piece_count = size.div_ceil(piece_size as u64);
        if piece_count > u32::MAX as u64 {
            anyhow::bail!(
                "{}: {} pieces of size {} do not fit a u32 index",
                id,
                piece_count,
                piece_size
            );
        }
        Ok(FileInfo {
            id,
            size,
            piece_size,
            ttl_seconds,
        })
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn path(&self) -> &ArchivePath {
        self.id.path()
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn default_piece_size(&self) -> u32 {
        self.piece_size
    }

    pub const fn ttl_seconds(&self) -> u32 {
        self.ttl_seconds
    }

    pub const fn piece_count(&self) -> u32 {
        self.size.div_ceil(self.piece_size as u64) as u32
    }

    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index >= self.piece_count() {
            return None;
        }
        Some(ValidPieceIndex(index))
    }

    pub fn try_validate_piece_index(&self, index: u32) -> anyhow::Result<ValidPieceIndex> {
        self.validate_piece_index(index)
            .with_context(|| format!("invalid piece index {} for {}", index, self.id))
    }

    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_size as u64
    }

    /// All pieces are piece_size long except the last, which holds the
    /// remainder.
    pub const fn piece_len(&self, index: ValidPieceIndex) -> u32 {
        if index.0 + 1 == self.piece_count() {
            return (self.size - index.0 as u64 * self.piece_size as u64) as u32;
        }
        self.piece_size
    }

    pub fn iter_piece_indexes(&self) -> impl Iterator<Item = ValidPieceIndex> + use<> {
        (0..self.piece_count()).map(ValidPieceIndex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str, size: u64, piece_size: u32) -> FileInfo {
        FileInfo::new(
            FileId::new(ArchivePath::new(path).unwrap()),
            size,
            piece_size,
            3600,
        )
        .unwrap()
    }

    #[test]
    fn test_path_validation() {
        assert!(ArchivePath::new("a/b.dat").is_ok());
        assert!(ArchivePath::new("").is_err());
        assert!(ArchivePath::new("/etc/passwd").is_err());
        assert!(ArchivePath::new("a/../b").is_err());
        assert!(ArchivePath::new("a//b").is_err());
        assert!(ArchivePath::new("a/./b").is_err());
        assert!(ArchivePath::new("a\\b").is_err());
    }

    #[test]
    fn test_sidecar_file_name() {
        let p = ArchivePath::new("a/b/c.dat").unwrap();
        assert_eq!(p.sidecar_file_name(), "a/b/.c.dat.pieces");
        let p = ArchivePath::new("top.dat").unwrap();
        assert_eq!(p.sidecar_file_name(), ".top.dat.pieces");
    }

    #[test]
    fn test_piece_arithmetic() {
        let f = info("x", 17, 8);
        assert_eq!(f.piece_count(), 3);
        let last = f.validate_piece_index(2).unwrap();
        assert_eq!(f.piece_len(f.validate_piece_index(0).unwrap()), 8);
        assert_eq!(f.piece_len(f.validate_piece_index(1).unwrap()), 8);
        assert_eq!(f.piece_len(last), 1);
        assert_eq!(f.piece_offset(last), 16);
        assert!(f.validate_piece_index(3).is_none());
    }

    #[test]
    fn test_offset_plus_len_invariant() {
        for (size, piece_size) in [(7u64, 8u32), (17, 8), (16, 8), (1, 1), (1000, 7)] {
            let f = info("f", size, piece_size);
            for i in f.iter_piece_indexes() {
                let end = f.piece_offset(i) + f.piece_len(i) as u64;
                assert!(end <= size);
                assert_eq!(end == size, i.get() + 1 == f.piece_count());
            }
        }
    }

    #[test]
    fn test_exact_multiple_last_piece_is_full() {
        let f = info("x", 16, 8);
        assert_eq!(f.piece_count(), 2);
        assert_eq!(f.piece_len(f.validate_piece_index(1).unwrap()), 8);
    }

    #[test]
    fn test_zero_length_file_has_no_pieces() {
        let f = info("empty", 0, 8);
        assert_eq!(f.piece_count(), 0);
        assert!(f.validate_piece_index(0).is_none());
    }

    #[test]
    fn test_zero_piece_size_rejected() {
        let id = FileId::new(ArchivePath::new("x").unwrap());
        assert!(FileInfo::new(id, 10, 0, 0).is_err());
    }
}
