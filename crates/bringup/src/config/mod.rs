//! Launch file parsing, substitution and run settings

mod launch_file;
mod settings;
mod substitution;

pub use launch_file::*;
pub use settings::*;
pub use substitution::*;
