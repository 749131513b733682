//! Process-wide server context. The OBS plugin ABI is globals-shaped, so
//! the audio and MIDI servers live in a once-initialised value: created on
//! first use, torn down when the module unloads.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crosswire_server::{AudioServer, CpalBackend, MidiServer};

pub struct ModuleContext {
    pub audio: Arc<AudioServer>,
    pub midi: Arc<MidiServer>,
}

static CONTEXT: Lazy<Mutex<Option<ModuleContext>>> = Lazy::new(|| Mutex::new(None));

/// The shared servers for this plugin module, created on first use.
pub fn module_context() -> ModuleContextGuard {
    let mut slot = CONTEXT.lock();
    if slot.is_none() {
        let audio = AudioServer::new(Arc::new(CpalBackend::new()));
        audio.start_maintenance();
        tracing::info!("crosswire module context initialised");
        *slot = Some(ModuleContext {
            audio,
            midi: MidiServer::new(),
        });
    }
    drop(slot);
    ModuleContextGuard
}

/// Lightweight accessor; clones of the inner Arcs are handed out per call
/// so the teardown path can drop the originals.
pub struct ModuleContextGuard;

impl ModuleContextGuard {
    pub fn audio(&self) -> Arc<AudioServer> {
        CONTEXT
            .lock()
            .as_ref()
            .map(|ctx| Arc::clone(&ctx.audio))
            .expect("module context torn down")
    }

    pub fn midi(&self) -> Arc<MidiServer> {
        CONTEXT
            .lock()
            .as_ref()
            .map(|ctx| Arc::clone(&ctx.midi))
            .expect("module context torn down")
    }
}

/// Called when the host unloads the module; drops the servers, which
/// closes every open device and stops the maintenance thread.
pub fn shutdown_module_context() {
    let mut slot = CONTEXT.lock();
    if slot.take().is_some() {
        tracing::info!("crosswire module context shut down");
    }
}
