pub mod bitset;
pub mod file_info;
pub mod predicate;
pub mod server_info;
pub mod spawn_utils;
pub mod spec_set;

pub use bitset::FiniteBitSet;
pub use file_info::{ArchivePath, FileId, FileInfo};
pub use predicate::{AttrKind, AttrValue, Attribute, Constraint, Filter, Predicate};
pub use server_info::{ServerInfo, SocketRole};
pub use spec_set::{FilePieceSpecs, MultiFilePieceSpecs, Piece, PieceSpec, PieceSpecSet};
