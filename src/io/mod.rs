//! On-disk image formats.

pub mod fits;

pub use fits::{load, load_master, save, save_master};
