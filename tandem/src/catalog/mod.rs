//! Download catalog: identity, pairing and resumable progress.

pub mod item;
pub mod manager;

pub use item::{Headers, Item, percentage};
pub use manager::{AddDownloadOptions, ItemManager};
