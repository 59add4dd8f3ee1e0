pub mod mem;
mod range;
mod sys_error;

pub use range::*;
pub use sys_error::*;
