pub mod cancel;
pub mod error;
pub mod text;

pub use cancel::CancellationToken;
pub use error::{Error, Result};
pub use text::truncate_chars;
