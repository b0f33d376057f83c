pub mod manager;
pub mod snapshot;
pub mod wal;

pub use manager::StorageManager;
pub use snapshot::{SnapshotDescription, SnapshotManager, StoreSnapshotData};
pub use wal::{WalReplay, WriteAheadLog};
