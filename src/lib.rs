pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod map;
pub mod system;
pub mod tracking;

#[cfg(test)]
mod testing;
