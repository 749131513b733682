use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atomic_float::AtomicF32;
use parking_lot::Mutex;

use crosswire_rt::AudioBuffer;
use crosswire_server::{AudioClient, AudioServer, ClientState, Direction};

/// Frames one host block may carry; scratch is sized for this up front.
const MAX_HOST_BLOCK: usize = 4096;

/// One routing filter instance: pulls its subscribed device inputs into
/// the host's audio, pushes the result to its subscribed device outputs.
///
/// `process` is host-audio-thread safe; everything else is control-path.
pub struct DeviceIo {
    client: AudioClient,
    gain_db: AtomicF32,
    bypass: AtomicBool,
    visible: AtomicBool,
    scratch: Mutex<AudioBuffer>,
}

impl DeviceIo {
    pub fn new(server: &Arc<AudioServer>) -> Self {
        Self {
            client: server.register_client(ClientState::default(), 8192),
            gain_db: AtomicF32::new(0.0),
            bypass: AtomicBool::new(false),
            visible: AtomicBool::new(false),
            scratch: Mutex::new(AudioBuffer::new(2, MAX_HOST_BLOCK)),
        }
    }

    pub fn gain_db(&self) -> f32 {
        self.gain_db.load(Ordering::Acquire)
    }

    pub fn set_gain_db(&self, gain_db: f32) {
        self.gain_db.store(gain_db, Ordering::Release);
    }

    pub fn bypass(&self) -> bool {
        self.bypass.load(Ordering::Acquire)
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.bypass.store(bypass, Ordering::Release);
    }

    /// Replaces the device subscriptions and grows the pull scratch to the
    /// new input width.
    pub fn set_subscriptions(&self, state: ClientState) {
        let inputs = state.inputs.len();
        self.client.set_subscriptions(state);
        self.scratch.lock().ensure_capacity(inputs.max(1), MAX_HOST_BLOCK);
    }

    pub fn subscriptions(&self) -> ClientState {
        self.client.subscriptions()
    }

    /// One host block, in place on `buffer`: device inputs are summed in
    /// at the configured gain, then the mixed signal feeds the device
    /// outputs.
    pub fn process(&self, buffer: &mut AudioBuffer, frames: usize, sample_rate: f64) {
        if self.bypass.load(Ordering::Acquire) {
            return;
        }
        let frames = frames.min(MAX_HOST_BLOCK);

        {
            // Contended only while set_subscriptions grows the scratch.
            if let Some(mut scratch) = self.scratch.try_lock() {
                let subs = self.client.input_subscription_count();
                if subs > 0 && subs <= scratch.channel_count() && frames <= scratch.len() {
                    self.client.pull_subscribed_inputs(&mut scratch, frames, sample_rate);
                    let gain = db_to_lin(self.gain_db.load(Ordering::Acquire));
                    buffer.add_from_with_gain(&scratch, frames, gain);
                }
            }
        }

        self.client.push_subscribed_outputs(buffer, frames, sample_rate);
    }

    /// Serialises gain, bypass, and the subscription set.
    pub fn get_state(&self) -> String {
        let state = self.client.subscriptions();
        format!(
            "gain_db={}\nbypass={}\nsubs={}",
            self.gain_db.load(Ordering::Acquire),
            u8::from(self.bypass.load(Ordering::Acquire)),
            state.serialize()
        )
    }

    /// Applies a state string produced by [`DeviceIo::get_state`].
    /// Unknown lines are ignored; malformed values keep their defaults.
    pub fn set_state(&self, state: &str) -> anyhow::Result<()> {
        for line in state.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "gain_db" => {
                    if let Ok(gain) = value.parse::<f32>() {
                        self.gain_db.store(gain, Ordering::Release);
                    }
                }
                "bypass" => {
                    self.bypass.store(value == "1", Ordering::Release);
                }
                "subs" => {
                    self.set_subscriptions(ClientState::deserialize(value));
                }
                other => {
                    tracing::debug!(key = other, "ignoring unknown state key");
                }
            }
        }
        Ok(())
    }

    /// Editor visibility hook from the host; routing keeps running either
    /// way.
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Release);
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    /// The configurable properties the host shell renders.
    pub fn properties() -> Vec<PropertySpec> {
        vec![
            PropertySpec {
                name: "gain_db",
                kind: PropertyKind::Float {
                    min: -60.0,
                    max: 12.0,
                    step: 0.1,
                },
            },
            PropertySpec {
                name: "bypass",
                kind: PropertyKind::Bool,
            },
            PropertySpec {
                name: "input_subscriptions",
                kind: PropertyKind::DeviceChannels {
                    direction: Direction::Input,
                },
            },
            PropertySpec {
                name: "output_subscriptions",
                kind: PropertyKind::DeviceChannels {
                    direction: Direction::Output,
                },
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyKind {
    Float { min: f32, max: f32, step: f32 },
    Bool,
    DeviceChannels { direction: Direction },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertySpec {
    pub name: &'static str,
    pub kind: PropertyKind,
}

#[inline]
fn db_to_lin(db: f32) -> f32 {
    if db <= -90.0 {
        0.0
    } else {
        (10.0f32).powf(db * 0.05)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosswire_server::testing::ManualBackend;
    use crosswire_server::{ChannelSubscription, DeviceBackend};

    fn server_with_device() -> (Arc<ManualBackend>, Arc<AudioServer>) {
        let backend = Arc::new(ManualBackend::new());
        backend.add_device("Test", "Dev", 4, 48_000.0, 128);
        let server = AudioServer::new(Arc::clone(&backend) as Arc<dyn DeviceBackend>);
        (backend, server)
    }

    fn sub_state() -> ClientState {
        ClientState {
            inputs: vec![ChannelSubscription::new("Test", "Dev", 0, Direction::Input)],
            outputs: vec![ChannelSubscription::new("Test", "Dev", 2, Direction::Output)],
        }
    }

    #[test]
    fn state_round_trips_semantically() {
        let (_backend, server) = server_with_device();
        let module = DeviceIo::new(&server);
        module.set_gain_db(-6.5);
        module.set_bypass(true);
        module.set_subscriptions(sub_state());

        let restored = DeviceIo::new(&server);
        restored.set_state(&module.get_state()).unwrap();

        assert_eq!(restored.gain_db(), -6.5);
        assert!(restored.bypass());
        assert_eq!(restored.subscriptions(), sub_state());
        assert_eq!(restored.get_state(), module.get_state());
    }

    #[test]
    fn bypass_leaves_host_audio_untouched() {
        let (_backend, server) = server_with_device();
        let module = DeviceIo::new(&server);
        module.set_subscriptions(sub_state());
        module.set_bypass(true);

        let mut buffer = AudioBuffer::new(2, 128);
        buffer.channel_mut(0).fill(0.5);
        module.process(&mut buffer, 128, 48_000.0);
        assert!(buffer.channel(0).iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn pulled_input_is_mixed_at_gain() {
        let (backend, server) = server_with_device();
        let module = DeviceIo::new(&server);
        module.set_subscriptions(ClientState {
            inputs: vec![ChannelSubscription::new("Test", "Dev", 0, Direction::Input)],
            outputs: Vec::new(),
        });
        // -6.02 dB is a factor of 0.5.
        module.set_gain_db(-6.02);

        let mut device_in = AudioBuffer::new(4, 128);
        device_in.channel_mut(0).fill(0.8);
        let mut device_out = AudioBuffer::new(4, 128);
        backend.drive_block("Test|Dev", &device_in, &mut device_out, 128);
        server.run_maintenance_once();

        let mut buffer = AudioBuffer::new(2, 480);
        let mut best = 0.0f32;
        for i in 0..200 {
            backend.drive_block("Test|Dev", &device_in, &mut device_out, 128);
            if i % 4 == 3 {
                buffer.clear();
                module.process(&mut buffer, 480, 48_000.0);
                best = best.max(
                    buffer.channel(0)[..480]
                        .iter()
                        .fold(0.0f32, |a, s| a.max(s.abs())),
                );
            }
        }
        assert!(
            (best - 0.4).abs() < 0.05,
            "expected ~0.4 after -6 dB of 0.8, saw {best}"
        );
    }

    #[test]
    fn properties_cover_the_configurable_surface() {
        let names: Vec<&str> = DeviceIo::properties().iter().map(|p| p.name).collect();
        assert!(names.contains(&"gain_db"));
        assert!(names.contains(&"bypass"));
        assert!(names.contains(&"input_subscriptions"));
        assert!(names.contains(&"output_subscriptions"));
    }
}
