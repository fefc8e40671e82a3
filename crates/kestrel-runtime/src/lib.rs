pub mod path_guard;
pub mod process;

pub use path_guard::*;
pub use process::*;
