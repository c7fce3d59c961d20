//! The set of blocked application/destination pairs.
//!
//! The capture path turns observed connections into [`BlockItem`]s with
//! [`BlocklistStore::from_connection`] and adds them, the enforcement path
//! asks [`BlocklistStore::lookup`] on every decision, and the UI reads,
//! sorts and persists the list.
//!
//! # Example
//!
//! ```
//! use firewall_helper::blocklist::{BlockItem, BlocklistStore, SortKey};
//!
//! let store = BlocklistStore::new("/tmp/blocklist.dat");
//! store.add(BlockItem::for_domain("Safari", "ads.example.com"));
//! store.sort(SortKey::Name, true);
//!
//! assert_eq!(store.len(), 1);
//! assert!(store.lookup(&store.get(0).unwrap()));
//! ```

mod item;
mod store;

pub use item::{BlockItem, Connection, ItemKey};
pub use store::{BlocklistStore, SortKey, StoreError};
