//! Built-in intermediate plugins.

pub mod odid_filter;
