mod parser;
mod reader;
mod structures;
mod writer;

pub use parser::ZipParser;
pub use reader::{ExtractOptions, ZipReader};
pub use structures::*;
pub use writer::{AddOptions, ZipWriter};
