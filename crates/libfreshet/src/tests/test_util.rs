use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tempfile::TempDir;

use freshet_core::file_info::ArchivePath;
use freshet_core::predicate::{Filter, Predicate};

use crate::archive::{Archive, ArchiveOptions};

pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Deterministic, non-uniform content so a piece written at the wrong
/// offset shows up as a mismatch.
pub fn patterned_content(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i as u8).wrapping_mul(31)))
        .collect()
}

pub fn write_archive_file(root: &Path, rel: &str, content: &[u8]) {
    let mut path = root.to_path_buf();
    for component in rel.split('/') {
        path.push(component);
    }
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

pub fn read_archive_file(root: &Path, rel: &str) -> Option<Vec<u8>> {
    let mut path = root.to_path_buf();
    for component in rel.split('/') {
        path.push(component);
    }
    std::fs::read(path).ok()
}

pub fn small_piece_archive(dir: &TempDir) -> Arc<Archive> {
    Archive::open(
        dir.path(),
        ArchiveOptions {
            default_piece_size: 8,
            ..Default::default()
        },
    )
    .unwrap()
}

pub fn predicate_wanting(paths: &[&str]) -> Arc<RwLock<Predicate>> {
    Arc::new(RwLock::new(Predicate::new(
        paths
            .iter()
            .map(|p| Filter::for_path(&ArchivePath::new(*p).unwrap()))
            .collect(),
    )))
}
