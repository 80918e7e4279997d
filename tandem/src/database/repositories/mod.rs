//! Repository traits and their sqlx implementations.

pub mod item;

pub use item::{ItemRepository, SqlxItemRepository};
