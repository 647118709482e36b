pub mod catalog;

pub use catalog::{ArgumentSpec, ArgumentType, ToolCatalog, ToolDescriptor};
