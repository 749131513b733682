//! Crosswire OBS adapter
//! =====================
//! The host-facing surface of the plugin: per-filter-instance modules that
//! route host audio to and from device subscriptions. The host shell
//! (filter registration, property sheets, settings persistence) lives in
//! the C plugin layer; this crate exposes the symmetric core operations:
//! `process`, `get_state`/`set_state`, `set_visible`, and a property
//! description.

pub mod device_io;

#[cfg(feature = "native")]
pub mod context;

pub use device_io::{DeviceIo, PropertyKind, PropertySpec};

#[cfg(feature = "native")]
pub use context::{module_context, shutdown_module_context, ModuleContext, ModuleContextGuard};
