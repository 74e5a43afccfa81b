#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod command;
pub mod config;
pub mod device;
pub mod errors;
pub mod tasks;
pub mod world;

pub use command::{CommandBuffer, CommandWriter};
pub use config::DeviceConfig;
pub use device::copy_queue::{ResourceCopyRange, SourceDataProvider};
pub use device::handle::{ObjectId, ObjectKind};
pub use device::output::{OffscreenOutput, OutputBackend, WindowManager};
pub use device::{CopyFence, Device};
pub use errors::EmberError;
pub use tasks::{SyncCounter, TaskPool};
pub use world::{
    CompiledScene, CompiledSector, IslandInstance, StreamingBox, StreamingEngine, StreamingGrid,
    StreamingIsland, StreamingObserver, StreamingTask,
};
