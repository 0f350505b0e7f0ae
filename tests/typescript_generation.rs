//! TypeScript Generation Tests
//!
//! Validates that the status types a frontend consumes can be exported to
//! TypeScript when the tauri feature is enabled.

#[cfg(feature = "tauri")]
#[test]
fn test_status_types_implement_specta_type() {
    use specta::Type;

    // If this compiles, all types are properly configured for TypeScript export.
    fn assert_type<T: Type>() {}

    // Status surface
    assert_type::<smartscreen::StreamStatus>();
    assert_type::<smartscreen::StreamMetrics>();
    assert_type::<smartscreen::RecoveryStatus>();
    assert_type::<smartscreen::ErrorSnapshot>();

    // Session and frame geometry
    assert_type::<smartscreen::SessionState>();
    assert_type::<smartscreen::session::Transition>();
    assert_type::<smartscreen::Rect>();
    assert_type::<smartscreen::FrameKind>();
}

#[cfg(not(feature = "tauri"))]
#[test]
fn test_tauri_feature_disabled() {
    // Types still compile without specta::Type
    let _ = smartscreen::SessionState::Disconnected;
    let _ = smartscreen::Rect::new(0, 0, 1, 1);
}
