pub mod fs;
pub mod process;
pub mod validation;

pub use self::{fs::*, process::*, validation::*};
