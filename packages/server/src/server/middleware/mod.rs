// HTTP middleware
pub mod internal_secret;

pub use internal_secret::*;
