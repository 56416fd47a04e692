// lib.rs
pub mod args;
pub mod collate;
pub mod config;
pub mod dataset;
pub mod encoder;
pub mod globals;
pub mod preference;
pub mod template;
pub mod utils;
