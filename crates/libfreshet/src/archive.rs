// Local directory tree of replicated files.
//
// Complete files are plain files under the root. A file still being
// received carries a hidden sidecar next to it (".<name>.pieces") with
// its FileInfo and completeness bit-set, so partial transfers survive a
// restart. The sidecar disappears the moment the last piece lands.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use freshet_core::bitset::FiniteBitSet;
use freshet_core::file_info::{ArchivePath, FileId, FileInfo};
use freshet_core::spec_set::{FilePieceSpecs, Piece, PieceSpec, PieceSpecSet};

use crate::error::ArchiveError;

pub const DEFAULT_PIECE_SIZE: u32 = 1 << 20;
pub const DEFAULT_TTL_SECONDS: u32 = 24 * 3600;

#[derive(Debug, Clone, Copy)]
pub struct ArchiveOptions {
    /// Piece size assigned to files that originate in this archive.
    /// Files received from peers keep the piece size of their source.
    pub default_piece_size: u32,
    pub default_ttl_seconds: u32,
    pub event_capacity: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            default_piece_size: DEFAULT_PIECE_SIZE,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutPieceOutcome {
    Stored { file_complete: bool },
    AlreadyPresent,
}

struct FileEntry {
    info: FileInfo,
    state: Mutex<FileState>,
}

struct FileState {
    have: FiniteBitSet,
}

pub struct Archive {
    root: PathBuf,
    options: ArchiveOptions,
    files: Mutex<HashMap<ArchivePath, Arc<FileEntry>>>,
    new_file_tx: broadcast::Sender<FileInfo>,
}

fn is_sidecar_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".pieces")
}

fn relative_archive_path(root: &Path, path: &Path) -> Option<ArchivePath> {
    let rel = path.strip_prefix(root).ok()?;
    let mut components = Vec::new();
    for component in rel.components() {
        match component {
            std::path::Component::Normal(c) => components.push(c.to_str()?),
            _ => return None,
        }
    }
    ArchivePath::new(components.join("/")).ok()
}

impl Archive {
    /// Scans the tree: sidecars register in-progress files with their
    /// saved completeness, everything else is a complete local file.
    pub fn open(root: &Path, options: ArchiveOptions) -> anyhow::Result<Arc<Archive>> {
        let root = root
            .canonicalize()
            .with_context(|| format!("error opening archive root {root:?}"))?;
        let (new_file_tx, _) = broadcast::channel(options.event_capacity);
        let archive = Archive {
            root,
            options,
            files: Mutex::new(HashMap::new()),
            new_file_tx,
        };
        archive.scan().context("error scanning archive")?;
        Ok(Arc::new(archive))
    }

    fn scan(&self) -> anyhow::Result<()> {
        let mut files = self.files.lock();
        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_sidecar_name(&name) {
                match self.load_sidecar(entry.path()) {
                    Ok(specs) => {
                        trace!(path = %specs.info().path(), have = specs.piece_count(), "found in-progress file");
                        files.insert(
                            specs.info().path().clone(),
                            Arc::new(FileEntry {
                                info: specs.info().clone(),
                                state: Mutex::new(FileState {
                                    have: specs.bits().clone(),
                                }),
                            }),
                        );
                    }
                    Err(e) => warn!(sidecar = ?entry.path(), "ignoring unreadable sidecar: {e:#}"),
                }
                continue;
            }
            let Some(path) = relative_archive_path(&self.root, entry.path()) else {
                warn!(path = ?entry.path(), "ignoring file with non-archivable path");
                continue;
            };
            if self.sidecar_fs_path(&path).exists() {
                // The sidecar entry owns this file's state.
                continue;
            }
            let size = entry.metadata()?.len();
            let info = FileInfo::new(
                FileId::new(path.clone()),
                size,
                self.options.default_piece_size,
                self.options.default_ttl_seconds,
            )?;
            trace!(%path, size, "found complete file");
            files.insert(
                path,
                Arc::new(FileEntry {
                    info: info.clone(),
                    state: Mutex::new(FileState {
                        have: FiniteBitSet::complete(info.piece_count()),
                    }),
                }),
            );
        }
        debug!(files = files.len(), root = ?self.root, "archive scanned");
        Ok(())
    }

    fn load_sidecar(&self, sidecar: &Path) -> anyhow::Result<FilePieceSpecs> {
        let bytes = std::fs::read(sidecar)?;
        let specs = wire_protocol::decode_file_piece_specs(&bytes)?;
        let derived = relative_archive_path(&self.root, sidecar)
            .map(|p| p.as_str().to_owned())
            .unwrap_or_default();
        let expected = specs.info().path().sidecar_file_name();
        if derived != expected {
            anyhow::bail!(
                "sidecar {derived:?} names file {}, expected {expected:?}",
                specs.info().path()
            );
        }
        Ok(specs)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_fs_path(&self, path: &ArchivePath) -> PathBuf {
        path.to_fs_path(&self.root)
    }

    fn sidecar_fs_path(&self, path: &ArchivePath) -> PathBuf {
        let mut out = self.root.clone();
        for component in path.sidecar_file_name().split('/') {
            out.push(component);
        }
        out
    }

    fn lookup(&self, path: &ArchivePath) -> Result<Arc<FileEntry>, ArchiveError> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| ArchiveError::UnknownFile(path.clone()))
    }

    pub fn file_info(&self, path: &ArchivePath) -> Option<FileInfo> {
        self.files.lock().get(path).map(|e| e.info.clone())
    }

    /// Complete files, in no particular order.
    pub fn walk(&self) -> Vec<FileInfo> {
        self.files
            .lock()
            .values()
            .filter(|e| e.state.lock().have.all_set())
            .map(|e| e.info.clone())
            .collect()
    }

    /// New-file events, emitted when a file reaches full completeness.
    pub fn subscribe(&self) -> broadcast::Receiver<FileInfo> {
        self.new_file_tx.subscribe()
    }

    /// Registers a file that is about to be received. Returns false if
    /// the path is already known. A zero-length file completes on the
    /// spot: there are no pieces to wait for.
    pub fn add_file(&self, info: FileInfo) -> Result<bool, ArchiveError> {
        {
            let files = self.files.lock();
            if files.contains_key(info.path()) {
                return Ok(false);
            }
        }
        let have = FiniteBitSet::empty(info.piece_count());
        let complete = have.all_set();
        if complete {
            let path = self.data_fs_path(info.path());
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            File::create(&path)?;
        } else {
            self.write_sidecar(&info, &have)?;
        }
        let inserted = {
            let mut files = self.files.lock();
            match files.contains_key(info.path()) {
                true => false,
                false => {
                    files.insert(
                        info.path().clone(),
                        Arc::new(FileEntry {
                            info: info.clone(),
                            state: Mutex::new(FileState { have }),
                        }),
                    );
                    true
                }
            }
        };
        if inserted && complete {
            let _ = self.new_file_tx.send(info);
        }
        Ok(inserted)
    }

    pub fn has_piece(&self, spec: &PieceSpec) -> bool {
        match self.files.lock().get(spec.path()) {
            Some(entry) => entry.state.lock().have.is_set(spec.index()),
            None => false,
        }
    }

    /// The pieces of a known file that have not arrived yet.
    pub fn missing_pieces(&self, path: &ArchivePath) -> Result<PieceSpecSet, ArchiveError> {
        let entry = self.lookup(path)?;
        let state = entry.state.lock();
        let mut missing = FilePieceSpecs::empty(entry.info.clone());
        for index in 0..entry.info.piece_count() {
            if !state.have.is_set(index) {
                missing.set_index(index);
            }
        }
        if missing.is_empty() {
            return Ok(PieceSpecSet::Empty);
        }
        Ok(PieceSpecSet::File(missing))
    }

    /// Positional read of one stored piece.
    pub fn get_piece(&self, spec: &PieceSpec) -> Result<Piece, ArchiveError> {
        let entry = self.lookup(spec.path())?;
        if entry.info != *spec.info() {
            return Err(self.bad_piece(spec, "spec disagrees with archived file info"));
        }
        {
            let state = entry.state.lock();
            if !state.have.is_set(spec.index()) {
                return Err(ArchiveError::PieceNotPresent {
                    path: spec.path().clone(),
                    index: spec.index(),
                });
            }
        }
        let mut file = File::open(self.data_fs_path(spec.path()))?;
        file.seek(SeekFrom::Start(spec.offset()))?;
        let mut buf = vec![0u8; spec.len() as usize];
        file.read_exact(&mut buf)?;
        Piece::new(spec.clone(), buf.into()).map_err(|e| self.bad_piece(spec, &format!("{e:#}")))
    }

    /// Positional write of one piece. Writes to the same file are
    /// serialized by the per-file lock; the completeness bit-set makes
    /// re-delivery a no-op.
    pub fn put_piece(&self, piece: &Piece) -> Result<PutPieceOutcome, ArchiveError> {
        let spec = piece.spec();
        let entry = self.lookup(spec.path())?;
        if entry.info != *spec.info() {
            return Err(self.bad_piece(spec, "spec disagrees with archived file info"));
        }

        let mut state = entry.state.lock();
        if state.have.is_set(spec.index()) {
            trace!(spec = %spec, "piece already present");
            return Ok(PutPieceOutcome::AlreadyPresent);
        }

        let path = self.data_fs_path(spec.path());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        if file.metadata()?.len() < entry.info.size() {
            file.set_len(entry.info.size())?;
        }
        file.seek(SeekFrom::Start(spec.offset()))?;
        file.write_all(piece.data())?;

        state.have.set(spec.index());
        if state.have.all_set() {
            match std::fs::remove_file(self.sidecar_fs_path(spec.path())) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            drop(state);
            debug!(path = %spec.path(), "file complete");
            let _ = self.new_file_tx.send(entry.info.clone());
            Ok(PutPieceOutcome::Stored {
                file_complete: true,
            })
        } else {
            self.write_sidecar(&entry.info, &state.have)?;
            Ok(PutPieceOutcome::Stored {
                file_complete: false,
            })
        }
    }

    /// Drops a file and its sidecar. Returns false if the path was not
    /// known.
    pub fn remove_file(&self, path: &ArchivePath) -> Result<bool, ArchiveError> {
        let existed = self.files.lock().remove(path).is_some();
        for fs_path in [self.data_fs_path(path), self.sidecar_fs_path(path)] {
            match std::fs::remove_file(&fs_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(existed)
    }

    fn write_sidecar(&self, info: &FileInfo, have: &FiniteBitSet) -> Result<(), ArchiveError> {
        // Sizes agree by construction of the entry.
        let specs = FilePieceSpecs::from_parts(info.clone(), have.clone())
            .expect("bit-set sized to piece count");
        let mut buf = Vec::new();
        wire_protocol::encode_file_piece_specs(&specs, &mut buf)
            .map_err(std::io::Error::other)?;
        let path = self.sidecar_fs_path(info.path());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &buf)?;
        Ok(())
    }

    fn bad_piece(&self, spec: &PieceSpec, reason: &str) -> ArchiveError {
        ArchiveError::BadPiece {
            path: spec.path().clone(),
            index: spec.index(),
            reason: reason.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn open_archive(dir: &Path) -> Arc<Archive> {
        Archive::open(
            dir,
            ArchiveOptions {
                default_piece_size: 8,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn file_info(path: &str, size: u64, piece_size: u32) -> FileInfo {
        FileInfo::new(
            FileId::new(ArchivePath::new(path).unwrap()),
            size,
            piece_size,
            600,
        )
        .unwrap()
    }

    fn piece(info: &FileInfo, index: u32, data: &[u8]) -> Piece {
        let spec = PieceSpec::new(info.clone(), index).unwrap();
        Piece::new(spec, Bytes::copy_from_slice(data)).unwrap()
    }

    #[test]
    fn test_scan_finds_complete_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/b.dat"), b"0123456").unwrap();
        let archive = open_archive(dir.path());
        let files = archive.walk();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path().as_str(), "a/b.dat");
        assert_eq!(files[0].size(), 7);
        assert_eq!(files[0].piece_count(), 1);
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(dir.path());
        let info = file_info("x/y.dat", 17, 8);
        assert!(archive.add_file(info.clone()).unwrap());

        let payloads: [&[u8]; 3] = [b"01234567", b"89abcdef", b"g"];
        for (i, payload) in payloads.iter().enumerate() {
            let outcome = archive.put_piece(&piece(&info, i as u32, payload)).unwrap();
            assert_eq!(
                outcome,
                PutPieceOutcome::Stored {
                    file_complete: i == 2
                }
            );
        }
        for (i, payload) in payloads.iter().enumerate() {
            let spec = PieceSpec::new(info.clone(), i as u32).unwrap();
            let got = archive.get_piece(&spec).unwrap();
            assert_eq!(got.data().as_ref(), *payload);
        }
        assert_eq!(
            std::fs::read(dir.path().join("x/y.dat")).unwrap(),
            b"0123456789abcdefg"
        );
        // Sidecar is gone once the file completes.
        assert!(!dir.path().join("x/.y.dat.pieces").exists());
    }

    #[test]
    fn test_put_piece_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(dir.path());
        let info = file_info("f", 17, 8);
        archive.add_file(info.clone()).unwrap();
        let p = piece(&info, 1, b"89abcdef");
        assert_eq!(
            archive.put_piece(&p).unwrap(),
            PutPieceOutcome::Stored {
                file_complete: false
            }
        );
        assert_eq!(archive.put_piece(&p).unwrap(), PutPieceOutcome::AlreadyPresent);
    }

    #[test]
    fn test_partial_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let info = file_info("f", 17, 8);
        {
            let archive = open_archive(dir.path());
            archive.add_file(info.clone()).unwrap();
            archive.put_piece(&piece(&info, 1, b"89abcdef")).unwrap();
        }
        let archive = open_archive(dir.path());
        // Not complete, so not in walk().
        assert!(archive.walk().is_empty());
        let spec0 = PieceSpec::new(info.clone(), 0).unwrap();
        let spec1 = PieceSpec::new(info.clone(), 1).unwrap();
        assert!(!archive.has_piece(&spec0));
        assert!(archive.has_piece(&spec1));

        let missing = archive.missing_pieces(info.path()).unwrap();
        assert!(missing.contains(&spec0));
        assert!(!missing.contains(&spec1));
        assert_eq!(missing.piece_count(), 2);

        archive.put_piece(&piece(&info, 0, b"01234567")).unwrap();
        let outcome = archive.put_piece(&piece(&info, 2, b"g")).unwrap();
        assert_eq!(
            outcome,
            PutPieceOutcome::Stored {
                file_complete: true
            }
        );
        assert_eq!(archive.walk().len(), 1);
    }

    #[test]
    fn test_completion_emits_event() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(dir.path());
        let mut events = archive.subscribe();
        let info = file_info("f", 7, 8);
        archive.add_file(info.clone()).unwrap();
        archive.put_piece(&piece(&info, 0, b"0123456")).unwrap();
        assert_eq!(events.try_recv().unwrap(), info);
    }

    #[test]
    fn test_zero_length_file_is_complete_on_add() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(dir.path());
        let mut events = archive.subscribe();
        let info = file_info("empty.dat", 0, 8);
        assert!(archive.add_file(info.clone()).unwrap());
        assert_eq!(events.try_recv().unwrap(), info);
        assert!(dir.path().join("empty.dat").exists());
        assert_eq!(archive.walk().len(), 1);
    }

    #[test]
    fn test_errors() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(dir.path());
        let info = file_info("f", 17, 8);
        let spec = PieceSpec::new(info.clone(), 0).unwrap();

        assert!(matches!(
            archive.get_piece(&spec),
            Err(ArchiveError::UnknownFile(_))
        ));
        archive.add_file(info.clone()).unwrap();
        assert!(matches!(
            archive.get_piece(&spec),
            Err(ArchiveError::PieceNotPresent { .. })
        ));

        // Same path, different geometry.
        let other = file_info("f", 17, 4);
        let bad = Piece::new(
            PieceSpec::new(other, 0).unwrap(),
            Bytes::copy_from_slice(b"0123"),
        )
        .unwrap();
        assert!(matches!(
            archive.put_piece(&bad),
            Err(ArchiveError::BadPiece { .. })
        ));
    }

    #[test]
    fn test_remove_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(dir.path());
        let info = file_info("f", 17, 8);
        archive.add_file(info.clone()).unwrap();
        archive.put_piece(&piece(&info, 0, b"01234567")).unwrap();
        assert!(dir.path().join(".f.pieces").exists());

        assert!(archive.remove_file(info.path()).unwrap());
        assert!(!dir.path().join("f").exists());
        assert!(!dir.path().join(".f.pieces").exists());
        assert!(!archive.remove_file(info.path()).unwrap());
    }
}
