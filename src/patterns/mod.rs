pub mod catalog;
pub mod embedded;
pub mod manifest;

pub use catalog::PatternCatalog;
