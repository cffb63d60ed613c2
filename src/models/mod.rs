pub mod source;
pub mod submission;

pub use source::*;
pub use submission::*;
