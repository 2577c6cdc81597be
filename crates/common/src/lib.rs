//! Types shared by the translation relay crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
