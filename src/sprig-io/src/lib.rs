pub mod read;
pub use read::{detect_format, InputFormat, NewickNode, ReadError};

pub mod write;
pub use write::WriteError;
