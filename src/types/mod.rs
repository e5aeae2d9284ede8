pub mod errors;
pub mod openai;

pub use errors::{ProxyError, Result};
