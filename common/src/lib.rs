#[macro_use]
pub mod macros;
pub mod file_format;
pub mod file_utils;
pub mod log_setup;
pub mod serde;
pub mod shared;

pub use crate::file_format::{FileExtensionError, SerdeFormat};
pub use crate::serde::{deserialize, load_from_file, serialize, Result};
pub use crate::shared::Shared;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}
