pub mod config;
pub mod engine_loop;
pub mod event_bus;
pub mod hooks;
pub mod retry;
pub mod storage;
pub mod workspaces;

pub use config::*;
pub use engine_loop::*;
pub use event_bus::*;
pub use hooks::*;
pub use retry::*;
pub use storage::*;
pub use workspaces::*;
