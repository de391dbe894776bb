pub mod atomic_write;
pub mod bom;
pub mod canonical;
pub mod error;
pub mod logging;
pub mod paths;
