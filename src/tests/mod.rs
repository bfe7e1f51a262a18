//! Session scenarios against in-memory devices and a scripted service.

/// Fake devices, scripted connector and wait helpers
pub mod test_utils;



pub use test_utils::*;
