//! Utility functions shared by the synchronization engine

pub mod paths;
pub mod values;

pub use values::{escape_curly_braces, escape_sql_literal, value_to_string};
