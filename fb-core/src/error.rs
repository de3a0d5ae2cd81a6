//! Error types, re-exported from `fb-error`

pub use fb_error::*;
