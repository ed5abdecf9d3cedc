/// BACnet application-data primitives (unsigned, enumerated, object id).
pub mod primitives;
/// Bounded cursor over an input slice.
pub mod reader;
/// Application and context tag coding.
pub mod tag;
/// Bounded cursor over an output slice.
pub mod writer;

pub use reader::Reader;
pub use writer::Writer;
