mod event;
mod message;
mod plan;
mod runtime;
mod tool;
mod usage;

pub use event::*;
pub use message::*;
pub use plan::*;
pub use runtime::*;
pub use tool::*;
pub use usage::*;
