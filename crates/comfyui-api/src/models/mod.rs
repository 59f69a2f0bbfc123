pub mod history;
pub mod prompt;
pub mod system_stats;

pub use history::*;
pub use prompt::*;
pub use system_stats::*;
