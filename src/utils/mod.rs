pub mod scheduled_executor;
pub mod text;

pub use scheduled_executor::{ScheduledExecutor, ScheduledTask, ShutdownHandle};
pub use text::{clean_optional_string, levenshtein};
