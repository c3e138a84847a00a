//! 模式目录

pub mod builtin;
pub mod catalog;

pub use catalog::{CatalogError, Mode, ModeCatalog, ModeConfig};
