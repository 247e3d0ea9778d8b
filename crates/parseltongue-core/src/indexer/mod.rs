pub mod dependencies;
pub mod filesystem;
pub mod keys;
pub mod languages;
pub mod parser;
pub mod pipeline;
pub mod resolution;
