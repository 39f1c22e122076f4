pub mod redaction;
pub mod ssrf;

pub use redaction::{RedactingWriter, redact_secrets};
pub use ssrf::validate_public_url;
