//! Byte-level readers shared by the command parser and the DATA phase.

pub mod data;
pub mod line;

pub use data::{DataReader, DataReaderError};
pub use line::{read_until, skip_to_newline, LineError};
