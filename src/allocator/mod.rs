//! Backing storage for recorded commands.

pub mod linear;

pub use linear::LinearArena;
