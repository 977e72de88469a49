#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod autopatcher;
pub mod code;
pub mod engine;
pub mod hook;
pub mod order;
pub mod patcher;
pub mod registry;
pub mod settings;
pub mod target;
pub mod unit;

pub use autopatcher::{AutoPatchReport, AutoPatchResult, AutoPatcher};
pub use engine::{MemoryEngine, PatchEngine};
pub use registry::PatchRegistry;
pub use unit::{PatchScope, PatchSite, PatchUnit, UnitDescriptor, UnitId, UnitType};
