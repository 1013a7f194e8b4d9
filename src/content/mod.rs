pub mod fileset;
pub mod glob;
pub mod processors;

pub use fileset::{CacheScope, FileRecord, Fileset, FilesetDef, Filesets, Status};
pub use glob::{Complement, Glob, GlobSet};
pub use processors::{ProcessorKind, SearchRecord};
