//! Database row models.

pub mod item;

pub use item::ItemDbModel;
