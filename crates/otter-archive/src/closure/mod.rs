//! Archive serialization closures.
//!
//! A structure is serialized by one walker function that calls the closure
//! once per field, in a fixed order. The same walker drives both directions:
//! with a [`WriteClosure`] it appends the fields to a dump region, with a
//! [`ReadClosure`] it fills them back in from a mapped archive. The word
//! stream carries no framing beyond the tags the walker emits, so the two
//! passes must visit fields in exactly the same order.
//!
//! ## Word stream
//!
//! Every field occupies one machine word:
//!
//! | Field       | Word                          | Relocated |
//! |-------------|-------------------------------|-----------|
//! | `do_ptr`    | raw pointer                   | yes       |
//! | `do_region` | byte-size tag, then each word | words yes |
//! | `do_oop`    | narrow heap reference         | no        |
//! | `do_u4`     | zero-extended `u32`           | no        |
//! | `do_bool`   | `0` or `1`                    | no        |
//! | `do_tag`    | sign-extended `i32`           | no        |

mod read;
mod write;

pub use read::ReadClosure;
pub use write::WriteClosure;

use crate::error::ArchiveResult;
use crate::oops::Oop;

/// Field-by-field serializer shared by the dump and load passes.
///
/// Destinations are `&mut` so one walker serves both directions; the writer
/// only reads them.
pub trait SerializeClosure {
    /// True for the load pass.
    fn reading(&self) -> bool;

    /// A raw pointer into the archive.
    fn do_ptr(&mut self, p: &mut usize) -> ArchiveResult<()>;

    /// A 32-bit scalar.
    fn do_u4(&mut self, p: &mut u32) -> ArchiveResult<()>;

    /// A flag.
    fn do_bool(&mut self, p: &mut bool) -> ArchiveResult<()>;

    /// A structural self-check value.
    fn do_tag(&mut self, tag: i32) -> ArchiveResult<()>;

    /// A heap object reference, stored compressed.
    fn do_oop(&mut self, p: &mut Option<Oop>) -> ArchiveResult<()>;

    /// A block of raw pointers, preceded by its byte size as a tag.
    fn do_region(&mut self, words: &mut [usize]) -> ArchiveResult<()>;
}

/// A structure that can be walked by a [`SerializeClosure`].
pub trait Serializable {
    /// Visit every archived field in a fixed order.
    fn serialize(&mut self, soc: &mut dyn SerializeClosure) -> ArchiveResult<()>;
}

/// Tag recorded in front of a region: its size in bytes.
pub(crate) fn region_tag(words: &[usize]) -> ArchiveResult<i32> {
    let size = std::mem::size_of_val(words);
    i32::try_from(size).map_err(|_| crate::error::ArchiveError::BadSize(size))
}
