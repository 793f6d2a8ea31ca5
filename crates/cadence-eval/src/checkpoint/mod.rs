mod gateway;
mod progress;
mod store;

pub use gateway::{
    CheckpointGateway, PartitionedCheckpointer, ReplicatedCheckpointer, create_checkpointer, fold_in,
};
pub use progress::{ProgressMarker, ProgressRecord, ProgressStatus, read_progress, resolve_restore_step};
pub use store::{CheckpointFile, CheckpointManifest, CheckpointStore, FsCheckpointStore};
