//! Profile loading, placeholder substitution, and configuration resolution

mod profile;
mod resolver;
mod substitution;

pub use profile::*;
pub use resolver::*;
pub use substitution::*;
