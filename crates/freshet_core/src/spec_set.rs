use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::warn;

use crate::bitset::FiniteBitSet;
use crate::file_info::{ArchivePath, FileInfo};

/// Exactly one piece of one file. The index is validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PieceSpec {
    info: FileInfo,
    index: u32,
}

impl PieceSpec {
    pub fn new(info: FileInfo, index: u32) -> anyhow::Result<Self> {
        info.try_validate_piece_index(index)?;
        Ok(PieceSpec { info, index })
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn path(&self) -> &ArchivePath {
        self.info.path()
    }

    pub const fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.index as u64 * self.info.default_piece_size() as u64
    }

    pub fn len(&self) -> u32 {
        // Index is valid by construction.
        let index = self.info.validate_piece_index(self.index).unwrap();
        self.info.piece_len(index)
    }
}

impl std::fmt::Display for PieceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.info.path(), self.index)
    }
}

/// One piece together with its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    spec: PieceSpec,
    data: Bytes,
}

impl Piece {
    pub fn new(spec: PieceSpec, data: Bytes) -> anyhow::Result<Self> {
        if data.len() as u32 != spec.len() {
            anyhow::bail!(
                "piece {} payload is {} bytes, expected {}",
                spec,
                data.len(),
                spec.len()
            );
        }
        Ok(Piece { spec, data })
    }

    pub fn spec(&self) -> &PieceSpec {
        &self.spec
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_parts(self) -> (PieceSpec, Bytes) {
        (self.spec, self.data)
    }
}

/// A subset of one file's pieces, backed by a finite bit-set sized to the
/// file's piece count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePieceSpecs {
    info: FileInfo,
    bits: FiniteBitSet,
}

impl FilePieceSpecs {
    pub fn empty(info: FileInfo) -> Self {
        let bits = FiniteBitSet::empty(info.piece_count());
        FilePieceSpecs { info, bits }
    }

    pub fn complete(info: FileInfo) -> Self {
        let bits = FiniteBitSet::complete(info.piece_count());
        FilePieceSpecs { info, bits }
    }

    pub fn from_parts(info: FileInfo, bits: FiniteBitSet) -> anyhow::Result<Self> {
        if bits.size() != info.piece_count() {
            anyhow::bail!(
                "bit-set of size {} does not match {} pieces of {}",
                bits.size(),
                info.piece_count(),
                info.path()
            );
        }
        Ok(FilePieceSpecs { info, bits })
    }

    pub fn of_piece(spec: &PieceSpec) -> Self {
        let mut out = FilePieceSpecs::empty(spec.info().clone());
        out.bits.set(spec.index());
        out
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn bits(&self) -> &FiniteBitSet {
        &self.bits
    }

    pub fn contains_index(&self, index: u32) -> bool {
        self.bits.is_set(index)
    }

    /// Marks one piece. Returns true iff it was newly set.
    pub fn set_index(&mut self, index: u32) -> bool {
        self.bits.set(index)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn piece_count(&self) -> u32 {
        self.bits.set_count()
    }

    /// Union with another set over the same file. Sets over files with
    /// disagreeing geometry cannot be merged; the callee wins.
    fn merge_from(&mut self, other: &FilePieceSpecs) {
        if self.info != other.info {
            warn!(
                path = %self.info.path(),
                "ignoring piece specs with mismatched file info during merge"
            );
            return;
        }
        // Sizes are equal by the from_parts invariant.
        self.bits.merge(&other.bits).unwrap();
    }

    pub fn iter(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        self.bits.iter_set().map(move |index| PieceSpec {
            info: self.info.clone(),
            index,
        })
    }
}

/// Piece subsets of many files, keyed by path so iteration is
/// lexicographic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiFilePieceSpecs {
    files: BTreeMap<ArchivePath, FilePieceSpecs>,
}

impl MultiFilePieceSpecs {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn get(&self, path: &ArchivePath) -> Option<&FilePieceSpecs> {
        self.files.get(path)
    }

    fn insert_merged(&mut self, specs: FilePieceSpecs) {
        match self.files.get_mut(specs.info.path()) {
            Some(existing) => existing.merge_from(&specs),
            None => {
                self.files.insert(specs.info.path().clone(), specs);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        self.files.values().flat_map(|f| f.iter())
    }
}

/// Algebra over sets of piece identifiers. Merge always returns the
/// cheapest representation that can hold the union, so a node tracking a
/// single outstanding piece pays for a single spec, not a map of bit-sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PieceSpecSet {
    #[default]
    Empty,
    One(PieceSpec),
    File(FilePieceSpecs),
    Multi(MultiFilePieceSpecs),
}

impl PieceSpecSet {
    pub fn merge(self, other: PieceSpecSet) -> PieceSpecSet {
        use PieceSpecSet::*;
        match (self, other) {
            (Empty, x) | (x, Empty) => x,
            (One(a), One(b)) => {
                if a.path() == b.path() {
                    if a.index() == b.index() {
                        return One(a);
                    }
                    let mut f = FilePieceSpecs::of_piece(&a);
                    f.bits.set(b.index());
                    File(f)
                } else {
                    Self::multi_of([FilePieceSpecs::of_piece(&a), FilePieceSpecs::of_piece(&b)])
                }
            }
            (One(a), File(mut f)) | (File(mut f), One(a)) => {
                if f.info.path() == a.path() {
                    f.bits.set(a.index());
                    File(f)
                } else {
                    Self::multi_of([f, FilePieceSpecs::of_piece(&a)])
                }
            }
            (File(mut a), File(b)) => {
                if a.info.path() == b.info.path() {
                    a.merge_from(&b);
                    File(a)
                } else {
                    Self::multi_of([a, b])
                }
            }
            (Multi(mut m), x) | (x, Multi(mut m)) => {
                match x {
                    Empty => {}
                    One(a) => m.insert_merged(FilePieceSpecs::of_piece(&a)),
                    File(f) => m.insert_merged(f),
                    Multi(n) => {
                        for (_, f) in n.files {
                            m.insert_merged(f);
                        }
                    }
                }
                Multi(m)
            }
        }
    }

    pub fn merge_piece(self, spec: &PieceSpec) -> PieceSpecSet {
        self.merge(PieceSpecSet::One(spec.clone()))
    }

    fn multi_of(files: impl IntoIterator<Item = FilePieceSpecs>) -> PieceSpecSet {
        let mut m = MultiFilePieceSpecs::default();
        for f in files {
            m.insert_merged(f);
        }
        PieceSpecSet::Multi(m)
    }

    pub fn contains(&self, spec: &PieceSpec) -> bool {
        match self {
            PieceSpecSet::Empty => false,
            PieceSpecSet::One(p) => p.path() == spec.path() && p.index() == spec.index(),
            PieceSpecSet::File(f) => {
                f.info.path() == spec.path() && f.contains_index(spec.index())
            }
            PieceSpecSet::Multi(m) => m
                .get(spec.path())
                .is_some_and(|f| f.contains_index(spec.index())),
        }
    }

    /// Removes one piece, collapsing to the cheapest remaining
    /// representation. Removing from a full set demotes it to a partial
    /// one. Returns true iff the piece was present.
    pub fn remove(&mut self, spec: &PieceSpec) -> bool {
        let removed = match self {
            PieceSpecSet::Empty => false,
            PieceSpecSet::One(p) => {
                if p.path() == spec.path() && p.index() == spec.index() {
                    *self = PieceSpecSet::Empty;
                    return true;
                }
                false
            }
            PieceSpecSet::File(f) => {
                if f.info.path() != spec.path() || !f.contains_index(spec.index()) {
                    false
                } else {
                    f.bits.clear(spec.index());
                    if f.is_empty() {
                        *self = PieceSpecSet::Empty;
                    }
                    return true;
                }
            }
            PieceSpecSet::Multi(m) => {
                let mut removed = false;
                if let Some(f) = m.files.get_mut(spec.path()) {
                    if f.contains_index(spec.index()) {
                        f.bits.clear(spec.index());
                        removed = true;
                        if f.is_empty() {
                            m.files.remove(spec.path());
                        }
                    }
                }
                if removed {
                    match m.file_count() {
                        0 => *self = PieceSpecSet::Empty,
                        1 => {
                            let (_, f) = m.files.pop_first().unwrap();
                            *self = PieceSpecSet::File(f);
                        }
                        _ => {}
                    }
                }
                removed
            }
        };
        removed
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PieceSpecSet::Empty => true,
            PieceSpecSet::One(_) => false,
            PieceSpecSet::File(f) => f.is_empty(),
            PieceSpecSet::Multi(m) => m.files.values().all(|f| f.is_empty()),
        }
    }

    pub fn piece_count(&self) -> u64 {
        match self {
            PieceSpecSet::Empty => 0,
            PieceSpecSet::One(_) => 1,
            PieceSpecSet::File(f) => f.piece_count() as u64,
            PieceSpecSet::Multi(m) => m.files.values().map(|f| f.piece_count() as u64).sum(),
        }
    }

    /// Lazily yields pieces in (path-lexicographic, index-ascending) order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = PieceSpec> + Send + '_> {
        match self {
            PieceSpecSet::Empty => Box::new(std::iter::empty()),
            PieceSpecSet::One(p) => Box::new(std::iter::once(p.clone())),
            PieceSpecSet::File(f) => Box::new(f.iter()),
            PieceSpecSet::Multi(m) => Box::new(m.iter()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_info::{ArchivePath, FileId};

    fn info(path: &str, size: u64, piece_size: u32) -> FileInfo {
        FileInfo::new(
            FileId::new(ArchivePath::new(path).unwrap()),
            size,
            piece_size,
            3600,
        )
        .unwrap()
    }

    fn spec(info: &FileInfo, index: u32) -> PieceSpec {
        PieceSpec::new(info.clone(), index).unwrap()
    }

    #[test]
    fn test_piece_spec_validates_index() {
        let f = info("f", 17, 8);
        assert!(PieceSpec::new(f.clone(), 2).is_ok());
        assert!(PieceSpec::new(f, 3).is_err());
    }

    #[test]
    fn test_piece_payload_length_is_validated() {
        let f = info("f", 17, 8);
        let last = spec(&f, 2);
        assert!(Piece::new(last.clone(), Bytes::from_static(b"x")).is_ok());
        assert!(Piece::new(last, Bytes::from_static(b"xy")).is_err());
    }

    #[test]
    fn test_merge_same_piece_stays_single() {
        let f = info("f", 17, 8);
        let merged = PieceSpecSet::One(spec(&f, 1)).merge(PieceSpecSet::One(spec(&f, 1)));
        assert_eq!(merged, PieceSpecSet::One(spec(&f, 1)));
    }

    #[test]
    fn test_merge_promotes_to_multi_and_orders_iteration() {
        let f = info("a/f", 17, 8);
        let g = info("b/g", 5, 8);
        let merged = PieceSpecSet::One(spec(&f, 0))
            .merge(PieceSpecSet::One(spec(&f, 1)))
            .merge(PieceSpecSet::One(spec(&g, 0)));
        match &merged {
            PieceSpecSet::Multi(m) => {
                assert_eq!(m.file_count(), 2);
                assert_eq!(m.get(f.path()).unwrap().piece_count(), 2);
                assert_eq!(m.get(g.path()).unwrap().piece_count(), 1);
            }
            other => panic!("expected Multi, got {other:?}"),
        }
        let order: Vec<(String, u32)> = merged
            .iter()
            .map(|p| (p.path().as_str().to_owned(), p.index()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a/f".to_owned(), 0),
                ("a/f".to_owned(), 1),
                ("b/g".to_owned(), 0)
            ]
        );
    }

    #[test]
    fn test_merge_contains_and_idempotence() {
        let f = info("f", 24, 8);
        let g = info("g", 8, 8);
        let pieces = [spec(&f, 0), spec(&f, 2), spec(&g, 0)];
        let mut set = PieceSpecSet::Empty;
        for p in &pieces {
            set = set.merge_piece(p);
        }
        for p in &pieces {
            assert!(set.contains(p));
        }
        assert!(!set.contains(&spec(&f, 1)));
        let again = set.clone().merge_piece(&pieces[1]);
        assert_eq!(again, set);
    }

    #[test]
    fn test_merge_is_commutative() {
        let f = info("f", 24, 8);
        let g = info("g", 8, 8);
        let a = PieceSpecSet::One(spec(&f, 0)).merge_piece(&spec(&f, 1));
        let b = PieceSpecSet::One(spec(&g, 0));
        let ab = a.clone().merge(b.clone());
        let ba = b.merge(a);
        let collect = |s: &PieceSpecSet| s.iter().collect::<Vec<_>>();
        assert_eq!(collect(&ab), collect(&ba));
    }

    #[test]
    fn test_merge_is_associative() {
        let f = info("f", 24, 8);
        let g = info("g", 8, 8);
        let a = PieceSpecSet::One(spec(&f, 0));
        let b = PieceSpecSet::One(spec(&f, 2));
        let c = PieceSpecSet::One(spec(&g, 0));
        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.merge(b.merge(c));
        let collect = |s: &PieceSpecSet| s.iter().collect::<Vec<_>>();
        assert_eq!(collect(&left), collect(&right));
    }

    #[test]
    fn test_merge_saturates_file_to_complete() {
        let f = info("f", 16, 8);
        let set = PieceSpecSet::One(spec(&f, 0)).merge_piece(&spec(&f, 1));
        match &set {
            PieceSpecSet::File(fs) => assert!(fs.bits().all_set()),
            other => panic!("expected File, got {other:?}"),
        }
    }

    #[test]
    fn test_remove_demotes_complete_and_collapses() {
        let f = info("f", 16, 8);
        let mut set = PieceSpecSet::File(FilePieceSpecs::complete(f.clone()));
        assert!(set.remove(&spec(&f, 0)));
        assert!(!set.contains(&spec(&f, 0)));
        assert!(set.contains(&spec(&f, 1)));
        assert!(set.remove(&spec(&f, 1)));
        assert_eq!(set, PieceSpecSet::Empty);
        assert!(!set.remove(&spec(&f, 1)));
    }

    #[test]
    fn test_multi_collapses_after_remove() {
        let f = info("a", 8, 8);
        let g = info("b", 8, 8);
        let mut set = PieceSpecSet::One(spec(&f, 0)).merge_piece(&spec(&g, 0));
        assert!(set.remove(&spec(&f, 0)));
        match &set {
            PieceSpecSet::File(fs) => assert_eq!(fs.info().path(), g.path()),
            other => panic!("expected File, got {other:?}"),
        }
    }
}
