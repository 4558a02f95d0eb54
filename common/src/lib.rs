#[macro_use]
pub mod macros;
pub mod cancel_token;
pub mod file_format;
pub mod file_utils;
pub mod key_index_vec;
pub mod log_setup;
pub mod serde;

pub use cancel_token::CancelToken;
pub use file_format::{FileExtensionError, FileFormat};
pub use uuid;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}
