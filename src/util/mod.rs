//! Text helpers shared by normalization and message rendering.

mod text;

pub use text::{strip_control_chars, truncate_chars};
