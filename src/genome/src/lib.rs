pub mod state;
pub use state::{Base, AmbigSet, ALPHABET_SIZE};

pub mod reference;
pub use reference::RefSeq;

pub mod mutation;
pub use mutation::{MutKind, Mutation};

pub mod sequence;
pub use sequence::Sequence;

pub mod alignment;
pub use alignment::Alignment;

/// 0-based genome position.
pub type Position = u32;
