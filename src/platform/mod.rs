/// Platform layer: engine registry, process archives and extensions

pub mod archive;
pub mod directory;
pub mod extension;
pub mod registry;

pub use archive::{ArchiveContext, ArchiveHandle, ArchiveProperties, ProcessArchive};
pub use directory::RuntimeDirectory;
pub use extension::PlatformExtension;
pub use registry::ProcessEngineRegistry;
