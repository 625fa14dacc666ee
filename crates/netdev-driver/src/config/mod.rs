pub mod cli;
pub mod daemon;
pub mod driver;

pub use cli::*;
pub use daemon::*;
pub use driver::*;
