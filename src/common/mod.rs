pub mod banner;
pub mod logger;
pub mod types;

pub use types::*;
