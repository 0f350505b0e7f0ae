//! End-to-end streaming tests against the simulated display
//!
//! Every test runs on a paused tokio clock, so frame pacing, write timeouts
//! and reconnect backoff are exact and take no wall time.

use std::time::Duration;

use futures::StreamExt;
use smartscreen::codec::{Bitmap, Rgb565};
use smartscreen::controller::{BackoffPolicy, PerformanceBudget, StreamController};
use smartscreen::protocol::brightness_level;
use smartscreen::transport::{SimulatedDevice, WriteFault};
use smartscreen::types::{PANEL_HEIGHT, PANEL_WIDTH, Rect};
use smartscreen::{EngineConfig, LinkError, SessionState, SmartScreen};
use tokio::time::sleep;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.session.write_timeout = Duration::from_millis(20);
    config.session.handshake_timeout = Duration::from_millis(50);
    config.backoff = BackoffPolicy {
        initial: Duration::from_millis(50),
        ceiling: Duration::from_millis(400),
        seed: Some(7),
        ..BackoffPolicy::default()
    };
    config
}

/// Bitmaps that change only inside `rect`, one new colour per frame.
fn dirty_sequence(rect: Rect, count: usize) -> Vec<Bitmap> {
    let mut current = Bitmap::filled(PANEL_WIDTH, PANEL_HEIGHT, Rgb565::BLACK);
    (0..count)
        .map(|i| {
            current.fill_rect(rect, Rgb565::from_rgb888((i * 8 + 8) as u8, (255 - i * 4) as u8, 0x40));
            current.clone()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn streams_dirty_rects_at_thirty_fps() {
    init_tracing();
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    let config = config();
    let interval = config.budget.frame_interval;
    let handle = StreamController::spawn(device.transport(), config).unwrap();
    handle.wait_for_state(SessionState::Streaming).await.unwrap();

    let rect = Rect::new(200, 100, 100, 50);
    let frames = dirty_sequence(rect, 60);

    // Publish half a period ahead of each tick so no bitmap is overwritten
    sleep(interval / 2).await;
    for bitmap in &frames {
        assert!(!handle.publish(bitmap.clone()).unwrap());
        sleep(interval).await;
    }
    sleep(interval).await;

    let status = handle.status();
    let metrics = &status.metrics;
    assert_eq!(status.state, SessionState::Streaming);
    assert_eq!(metrics.frames_sent, 60);
    assert_eq!(metrics.full_frames, 1);
    assert_eq!(metrics.dirty_frames, 59);
    assert_eq!(metrics.overwritten_frames, 0);
    assert_eq!(metrics.consecutive_failures, 0);
    assert_eq!(metrics.frame_divisor, 1);
    assert!((metrics.fps - 30.0).abs() < 0.5, "fps was {}", metrics.fps);
    assert!(metrics.throughput_bps > 0.0);
    assert!(status.message.starts_with("Streaming at"));

    // Setup window, then one window per dirty frame
    let windows = device.windows();
    assert_eq!(windows.len(), 60);
    assert!(windows[1..].iter().all(|w| *w == rect));
    assert_eq!(device.snapshot(), frames[59]);
}

#[tokio::test(start_paused = true)]
async fn write_failures_recover_through_reconnect() {
    init_tracing();
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    let handle = StreamController::spawn(device.transport(), config()).unwrap();
    handle.wait_for_state(SessionState::Streaming).await.unwrap();
    assert_eq!(device.open_count(), 1);

    device.fail_next_writes(4, WriteFault::Timeout);
    let bitmap = Bitmap::filled(PANEL_WIDTH, PANEL_HEIGHT, Rgb565::WHITE);
    handle.publish(bitmap.clone()).unwrap();

    let degraded = handle.wait_for_state(SessionState::Degraded).await.unwrap();
    assert_eq!(degraded.last_error.as_ref().unwrap().code, "write_timeout");

    let recovering = handle.wait_for_state(SessionState::Recovering).await.unwrap();
    let recovery = recovering.recovery.expect("recovery status while recovering");
    assert_eq!(recovery.reason, "write_timeout");
    assert_eq!(recovery.attempt, 0);
    assert!(recovering.message.starts_with("Reconnecting"));
    assert_eq!(recovering.metrics.total_failures, 4);

    let streaming = handle.wait_for_state(SessionState::Streaming).await.unwrap();
    assert!(streaming.recovery.is_none());
    assert_eq!(device.open_count(), 2);

    // The bitmap that never made it is sent in full on the new link
    sleep(Duration::from_millis(100)).await;
    assert_eq!(device.snapshot(), bitmap);
    assert!(handle.status().metrics.full_frames >= 1);
}

#[tokio::test(start_paused = true)]
async fn unplug_is_noticed_and_replug_resumes() {
    init_tracing();
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    let handle = StreamController::spawn(device.transport(), config()).unwrap();
    handle.wait_for_state(SessionState::Streaming).await.unwrap();

    device.unplug();
    let recovering = handle.wait_for_state(SessionState::Recovering).await.unwrap();
    assert_eq!(recovering.recovery.unwrap().reason, "link_lost");

    // Attempts keep failing while unplugged, backing off up to the ceiling
    sleep(Duration::from_secs(2)).await;
    let status = handle.status();
    assert_eq!(status.state, SessionState::Recovering);
    let recovery = status.recovery.unwrap();
    assert!(recovery.attempt >= 3, "only {} attempts", recovery.attempt);
    assert!(recovery.next_retry_ms <= 400);
    assert_eq!(status.last_error.unwrap().code, "device_not_found");

    device.replug();
    handle.wait_for_state(SessionState::Streaming).await.unwrap();
    assert_eq!(device.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_device_halts_until_reconnect() {
    init_tracing();
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    device.unplug();
    let handle = StreamController::spawn(device.transport(), config()).unwrap();

    sleep(Duration::from_millis(500)).await;
    let status = handle.status();
    assert_eq!(status.state, SessionState::Disconnected);
    assert_eq!(status.last_error.as_ref().unwrap().code, "device_not_found");
    assert!(status.message.starts_with("Disconnected:"));
    assert_eq!(device.open_count(), 0);

    device.replug();
    handle.reconnect().unwrap();
    handle.wait_for_state(SessionState::Streaming).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn manual_connect_when_auto_connect_is_off() {
    init_tracing();
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    let config = EngineConfig { auto_connect: false, ..config() };
    let handle = StreamController::spawn(device.transport(), config).unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.status().state, SessionState::Disconnected);
    assert_eq!(device.open_count(), 0);

    handle.reconnect().unwrap();
    handle.wait_for_state(SessionState::Streaming).await.unwrap();
    assert_eq!(device.hello_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn caller_errors_are_synchronous() {
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    let handle = StreamController::spawn(device.transport(), config()).unwrap();

    let budget = PerformanceBudget { frame_interval: Duration::ZERO, ..PerformanceBudget::default() };
    assert!(matches!(handle.set_budget(budget), Err(LinkError::InvalidConfig { .. })));
    assert!(matches!(handle.set_brightness(101), Err(LinkError::InvalidConfig { .. })));
    assert!(matches!(
        handle.publish(Bitmap::filled(PANEL_HEIGHT, PANEL_WIDTH, Rgb565::BLACK)),
        Err(LinkError::InvalidFrame { .. })
    ));

    let bad = EngineConfig { budget, ..config() };
    assert!(StreamController::spawn(SimulatedDevice::new(8, 4).transport(), bad).is_err());
}

#[tokio::test(start_paused = true)]
async fn budget_and_brightness_apply_at_the_next_tick() {
    init_tracing();
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    let handle = StreamController::spawn(device.transport(), config()).unwrap();
    handle.wait_for_state(SessionState::Streaming).await.unwrap();

    handle.publish(Bitmap::filled(PANEL_WIDTH, PANEL_HEIGHT, Rgb565::BLACK)).unwrap();
    sleep(Duration::from_millis(100)).await;

    handle.set_brightness(40).unwrap();
    handle.set_budget(PerformanceBudget::from_fps(10.0).unwrap()).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(device.brightness_level(), Some(brightness_level(40)));

    // Enough frames that the rate window holds only the slower sends
    let rect = Rect::new(0, 0, 10, 10);
    let frames = dirty_sequence(rect, 40);
    sleep(Duration::from_millis(50)).await;
    for bitmap in frames {
        handle.publish(bitmap).unwrap();
        sleep(Duration::from_millis(100)).await;
    }
    let fps = handle.status().metrics.fps;
    assert!((fps - 10.0).abs() < 0.5, "fps was {fps}");
}

#[tokio::test(start_paused = true)]
async fn slow_writes_lower_the_frame_rate_until_they_recover() {
    init_tracing();
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    let mut config = config();
    config.session.write_timeout = Duration::from_millis(100);
    let interval = config.budget.frame_interval;
    let max_divisor = config.adaptive.max_frame_divisor;
    let handle = StreamController::spawn(device.transport(), config).unwrap();
    handle.wait_for_state(SessionState::Streaming).await.unwrap();

    // Full frame first, while the link is still fast
    handle.publish(Bitmap::filled(PANEL_WIDTH, PANEL_HEIGHT, Rgb565::BLACK)).unwrap();
    sleep(interval * 3).await;
    assert_eq!(handle.status().metrics.full_frames, 1);

    // Window plus one pixel chunk at 40 ms each is well over a 33 ms budget
    device.set_write_latency(Duration::from_millis(40));
    let frames = dirty_sequence(Rect::new(0, 0, 10, 10), 360);
    let (slow, healthy) = frames.split_at(90);
    for bitmap in slow {
        handle.publish(bitmap.clone()).unwrap();
        sleep(interval).await;
    }

    let status = handle.status();
    assert_eq!(status.state, SessionState::Streaming);
    assert!(status.metrics.frame_divisor > 1, "divisor stayed at {}", status.metrics.frame_divisor);
    assert!(status.metrics.frame_divisor <= max_divisor);
    assert!(status.metrics.skipped_ticks > 0);
    assert!(status.metrics.write_latency_ms > 33.0);
    assert_eq!(status.metrics.total_failures, 0);

    device.set_write_latency(Duration::ZERO);
    for bitmap in healthy {
        handle.publish(bitmap.clone()).unwrap();
        sleep(interval).await;
    }
    sleep(interval * 2).await;

    let status = handle.status();
    assert_eq!(status.state, SessionState::Streaming);
    assert_eq!(status.metrics.frame_divisor, 1);
    assert_eq!(status.metrics.total_failures, 0);
    assert_eq!(device.snapshot(), frames[359]);
}

#[tokio::test(start_paused = true)]
async fn status_stream_reports_the_connection() {
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    let handle = SmartScreen::stream_with(device.transport(), config()).unwrap();

    let states: Vec<SessionState> = handle
        .status_updates()
        .map(|status| status.state)
        .take_while(|state| futures::future::ready(*state != SessionState::Streaming))
        .collect()
        .await;
    assert_eq!(states.first(), Some(&SessionState::Disconnected));
    assert_eq!(handle.status().port.as_deref(), Some("sim://display0"));
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_the_port() {
    let device = SimulatedDevice::new(PANEL_WIDTH, PANEL_HEIGHT);
    let mut handle = StreamController::spawn(device.transport(), config()).unwrap();
    handle.wait_for_state(SessionState::Streaming).await.unwrap();
    assert!(device.is_held());

    handle.disconnect().await;
    assert!(!device.is_held());
    assert_eq!(handle.status().state, SessionState::Disconnected);
    assert!(handle.reconnect().is_err());
}
