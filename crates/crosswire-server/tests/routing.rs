use std::sync::Arc;
use std::time::Duration;

use crosswire_rt::AudioBuffer;
use crosswire_server::testing::ManualBackend;
use crosswire_server::{
    AudioServer, ChannelSubscription, ClientState, DeviceBackend, Direction,
};

const RATE: f64 = 48_000.0;
const DEVICE_BLOCK: usize = 128;
const CLIENT_BLOCK: usize = 480;

fn setup() -> (Arc<ManualBackend>, Arc<AudioServer>) {
    let backend = Arc::new(ManualBackend::new());
    backend.add_device("Test", "DevA", 4, RATE, DEVICE_BLOCK);
    backend.add_device("Test", "DevB", 4, RATE, DEVICE_BLOCK);
    let server = AudioServer::new(Arc::clone(&backend) as Arc<dyn DeviceBackend>);
    (backend, server)
}

fn input_sub(device: &str, channel: usize) -> ChannelSubscription {
    ChannelSubscription::new("Test", device, channel, Direction::Input)
}

fn output_sub(device: &str, channel: usize) -> ChannelSubscription {
    ChannelSubscription::new("Test", device, channel, Direction::Output)
}

fn inputs_only(subs: Vec<ChannelSubscription>) -> ClientState {
    ClientState {
        inputs: subs,
        outputs: Vec::new(),
    }
}

/// Drives `device` once with `value` on `channel`, returning device output.
fn drive(
    backend: &ManualBackend,
    device: &str,
    channel: usize,
    value: f32,
    out: &mut AudioBuffer,
) -> bool {
    let mut input = AudioBuffer::new(4, DEVICE_BLOCK);
    input.channel_mut(channel).fill(value);
    backend.drive_block(&format!("Test|{device}"), &input, out, DEVICE_BLOCK)
}

fn peak(buffer: &AudioBuffer, channel: usize, frames: usize) -> f32 {
    buffer.channel(channel)[..frames]
        .iter()
        .fold(0.0f32, |a, s| a.max(s.abs()))
}

#[test]
fn subscription_opens_device_lazily_and_routes_input() {
    let (backend, server) = setup();
    assert!(!backend.is_open("Test|DevA"));

    let client = server.register_client(inputs_only(vec![input_sub("DevA", 0)]), 8192);
    assert!(backend.is_open("Test|DevA"));
    assert!(server.has_active_subscriptions("Test", "DevA"));

    let mut device_out = AudioBuffer::new(4, DEVICE_BLOCK);
    let mut pulled = AudioBuffer::new(1, CLIENT_BLOCK);

    // First device block reveals the writer parameters, then the
    // maintenance pass finishes SyncBuffer preparation.
    drive(&backend, "DevA", 0, 0.5, &mut device_out);
    server.run_maintenance_once();

    let mut best = 0.0f32;
    for i in 0..200 {
        drive(&backend, "DevA", 0, 0.5, &mut device_out);
        if i % 4 == 3 {
            client.pull_subscribed_inputs(&mut pulled, CLIENT_BLOCK, RATE);
            best = best.max(peak(&pulled, 0, CLIENT_BLOCK));
        }
    }
    assert!(best > 0.3, "device audio never reached the client (peak {best})");
}

#[test]
fn client_output_reaches_device_channel() {
    let (backend, server) = setup();
    let client = server.register_client(
        ClientState {
            inputs: Vec::new(),
            outputs: vec![output_sub("DevA", 2)],
        },
        8192,
    );

    let mut push = AudioBuffer::new(1, CLIENT_BLOCK);
    push.channel_mut(0).fill(0.25);
    let mut device_out = AudioBuffer::new(4, DEVICE_BLOCK);

    // Reader side is observed by the first device block; writer side by
    // the first push.
    client.push_subscribed_outputs(&push, CLIENT_BLOCK, RATE);
    drive(&backend, "DevA", 0, 0.0, &mut device_out);
    server.run_maintenance_once();

    let mut best = 0.0f32;
    for _ in 0..50 {
        client.push_subscribed_outputs(&push, CLIENT_BLOCK, RATE);
        for _ in 0..3 {
            drive(&backend, "DevA", 0, 0.0, &mut device_out);
            best = best.max(peak(&device_out, 2, DEVICE_BLOCK));
            // Channels the client never subscribed stay silent.
            assert_eq!(peak(&device_out, 0, DEVICE_BLOCK), 0.0);
        }
    }
    assert!(best > 0.2, "client output never reached the device (peak {best})");
}

#[test]
fn hot_swap_never_mixes_devices() {
    let (backend, server) = setup();
    server.set_close_grace(Duration::ZERO);

    let client = server.register_client(inputs_only(vec![input_sub("DevA", 0)]), 8192);

    let mut device_out = AudioBuffer::new(4, DEVICE_BLOCK);
    let mut pulled = AudioBuffer::new(1, CLIENT_BLOCK);

    drive(&backend, "DevA", 0, 0.5, &mut device_out);
    server.run_maintenance_once();
    let mut saw_a = false;
    for i in 0..200 {
        drive(&backend, "DevA", 0, 0.5, &mut device_out);
        if i % 4 == 3 {
            client.pull_subscribed_inputs(&mut pulled, CLIENT_BLOCK, RATE);
            saw_a |= peak(&pulled, 0, CLIENT_BLOCK) > 0.3;
        }
    }
    assert!(saw_a);

    // Swap to DevB channel 3 while DevA keeps running.
    client.set_subscriptions(inputs_only(vec![input_sub("DevB", 3)]));

    for _ in 0..50 {
        drive(&backend, "DevA", 0, 0.5, &mut device_out);
        client.pull_subscribed_inputs(&mut pulled, CLIENT_BLOCK, RATE);
        assert_eq!(
            peak(&pulled, 0, CLIENT_BLOCK),
            0.0,
            "audio from the old device leaked through after the swap"
        );
    }

    // The old device goes inactive and closes once the grace expires.
    assert!(!server.has_active_subscriptions("Test", "DevA"));
    server.run_maintenance_once();
    assert!(!backend.is_open("Test|DevA"));

    drive(&backend, "DevB", 3, 0.9, &mut device_out);
    server.run_maintenance_once();
    let mut best = 0.0f32;
    for i in 0..200 {
        drive(&backend, "DevB", 3, 0.9, &mut device_out);
        if i % 4 == 3 {
            client.pull_subscribed_inputs(&mut pulled, CLIENT_BLOCK, RATE);
            // Interpolation may overshoot the step slightly, never the
            // old device's level profile.
            let value = peak(&pulled, 0, CLIENT_BLOCK);
            assert!(value < 1.0, "unexpected level {value}");
            best = best.max(value);
        }
    }
    assert!(best > 0.5, "new device audio never arrived (peak {best})");
}

#[test]
fn identical_update_is_a_no_op() {
    let (backend, server) = setup();
    let state = inputs_only(vec![input_sub("DevA", 0)]);
    let client = server.register_client(state.clone(), 8192);

    let mut device_out = AudioBuffer::new(4, DEVICE_BLOCK);
    let mut pulled = AudioBuffer::new(1, CLIENT_BLOCK);
    drive(&backend, "DevA", 0, 0.5, &mut device_out);
    server.run_maintenance_once();
    for _ in 0..40 {
        drive(&backend, "DevA", 0, 0.5, &mut device_out);
    }
    client.pull_subscribed_inputs(&mut pulled, CLIENT_BLOCK, RATE);

    let handler_before = server.device_handler("Test", "DevA").unwrap();
    assert_eq!(backend.open_count("Test|DevA"), 1);

    client.set_subscriptions(state);

    // No device churn, and the running SyncBuffer survived: audio flows
    // without another maintenance pass.
    assert_eq!(backend.open_count("Test|DevA"), 1);
    let handler_after = server.device_handler("Test", "DevA").unwrap();
    assert!(Arc::ptr_eq(&handler_before, &handler_after));

    let mut flowing = false;
    for i in 0..40 {
        drive(&backend, "DevA", 0, 0.5, &mut device_out);
        if i % 4 == 3 {
            client.pull_subscribed_inputs(&mut pulled, CLIENT_BLOCK, RATE);
            flowing |= peak(&pulled, 0, CLIENT_BLOCK) > 0.3;
        }
    }
    assert!(flowing, "no-op update disturbed the running buffers");
}

#[test]
fn sample_rate_change_reopens_device() {
    let (backend, server) = setup();
    let client = server.register_client(inputs_only(vec![input_sub("DevA", 0)]), 8192);

    let mut device_out = AudioBuffer::new(4, DEVICE_BLOCK);
    let mut pulled = AudioBuffer::new(1, CLIENT_BLOCK);
    drive(&backend, "DevA", 0, 0.5, &mut device_out);
    server.run_maintenance_once();

    assert_eq!(server.current_sample_rate("Test", "DevA"), RATE);
    server
        .set_device_sample_rate("Test", "DevA", 44_100.0)
        .unwrap();
    assert_eq!(backend.stream_sample_rate("Test|DevA"), Some(44_100.0));
    assert_eq!(server.current_sample_rate("Test", "DevA"), 44_100.0);
    assert_eq!(backend.open_count("Test|DevA"), 2);

    assert!(server
        .set_device_sample_rate("Test", "DevA", 12_345.0)
        .is_err());

    // The client keeps pulling across the rate change; the SyncBuffer
    // follows the device's new rate on the next blocks.
    let mut best = 0.0f32;
    for i in 0..300 {
        drive(&backend, "DevA", 0, 0.5, &mut device_out);
        server.run_maintenance_once();
        if i % 4 == 3 {
            client.pull_subscribed_inputs(&mut pulled, CLIENT_BLOCK, RATE);
            best = best.max(peak(&pulled, 0, CLIENT_BLOCK));
        }
    }
    assert!(best > 0.3, "audio stalled after rate change (peak {best})");
}

#[test]
fn dropping_client_releases_device() {
    let (backend, server) = setup();
    server.set_close_grace(Duration::ZERO);
    let client = server.register_client(inputs_only(vec![input_sub("DevA", 0)]), 8192);
    assert!(backend.is_open("Test|DevA"));

    drop(client);
    assert!(!server.has_active_subscriptions("Test", "DevA"));
    server.run_maintenance_once();
    assert!(!backend.is_open("Test|DevA"));
    assert!(server.device_handler("Test", "DevA").is_none());
}

#[test]
fn unknown_device_subscription_is_harmless() {
    let (_backend, server) = setup();
    let client = server.register_client(inputs_only(vec![input_sub("Ghost", 0)]), 8192);

    let mut pulled = AudioBuffer::new(1, CLIENT_BLOCK);
    client.pull_subscribed_inputs(&mut pulled, CLIENT_BLOCK, RATE);
    assert_eq!(peak(&pulled, 0, CLIENT_BLOCK), 0.0);

    // The subscription stays recorded for a later successful open.
    assert_eq!(client.subscriptions().inputs.len(), 1);
}

#[test]
fn capability_queries_are_cached() {
    let (_backend, server) = setup();
    let names = server.device_channel_names("Test", "DevA", Direction::Input);
    assert_eq!(names.len(), 4);
    let rates = server.available_sample_rates("Test", "DevA");
    assert!(rates.contains(&48_000.0));
    let sizes = server.available_buffer_sizes("Test", "DevA");
    assert!(sizes.contains(&DEVICE_BLOCK));

    server.invalidate_device_cache("Test", "DevA");
    assert_eq!(
        server.device_channel_names("Test", "DevA", Direction::Input).len(),
        4
    );

    let inputs = server.available_input_devices();
    assert!(inputs.iter().any(|(_, name)| name == "DevA"));
}
