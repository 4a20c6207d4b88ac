//! Utilities module - text helpers shared by the engine and the CLI

pub mod text_utils;

pub use text_utils::{preview, truncate_with_ellipsis};
