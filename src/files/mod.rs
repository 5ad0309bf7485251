//! Printer file listings: the pure tree projection and the cached catalog.

pub mod catalog;
pub mod tree;

pub use catalog::PrinterFileCatalog;
pub use tree::{FileNode, PrinterFileEntry, project};
