use std::time::Duration;

/// Server-side WebSocket keep-alive: after this much inactivity on a
/// connection, the server sends a `chsk/ws-ping` to probe it.
pub const WS_KALIVE_SERVER: Duration = Duration::from_millis(25_000);

/// Client-side WebSocket keep-alive period (must differ from the server's
/// so pings interleave rather than collide).
pub const WS_KALIVE_CLIENT: Duration = Duration::from_millis(20_000);

/// How long the client waits for a `"pong"` reply to its keep-alive ping
/// before cycling the socket.
pub const WS_KALIVE_PING_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Server-side long-poll timeout: an open Ajax poll with nothing to send
/// is answered with the `chsk/timeout` sentinel after this long.
///
/// Must be shorter than [`LP_CLIENT_POLL_TIMEOUT`] so the server always
/// answers before the client's HTTP request gives up.
pub const LP_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Client-side HTTP timeout for one long-poll request.
pub const LP_CLIENT_POLL_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Delay before flushing buffered sends to WebSocket connections.
/// Near-simultaneous sends within this window coalesce into one frame.
pub const SEND_BUF_WS: Duration = Duration::from_millis(30);

/// Delay before flushing buffered sends to Ajax pollers. Longer than the
/// WebSocket window because each flush costs a full HTTP round trip.
pub const SEND_BUF_AJAX: Duration = Duration::from_millis(100);

/// Grace window after a WebSocket close during which the registry entry
/// survives so a quick reconnect is not observed as a uidport close.
pub const RECONNECT_GRACE_WS: Duration = Duration::from_millis(2_500);

/// Grace window after an Ajax connection close. Longer than the WebSocket
/// window: every long-poll response closes the connection and the repoll
/// takes a round trip to reattach.
pub const RECONNECT_GRACE_AJAX: Duration = Duration::from_millis(5_000);

/// Fan-out retry backoff, in milliseconds. Each step is jittered into
/// `[b, 2b)`; a client still unreachable after the last step loses the
/// batch (delivery across reconnects is best-effort, not durable).
pub const FANOUT_BACKOFF_MS: [u64; 5] = [90, 180, 360, 720, 1440];

/// Capacity of the server's receive channel.
pub const SERVER_RECV_BUF: usize = 1_000;

/// Capacity of the client's receive channel.
pub const CLIENT_RECV_BUF: usize = 2_048;

/// Length of generated callback ids.
pub const CB_UUID_LEN: usize = 6;

/// Current epoch millis. Doubles as the connection identity token (udt):
/// two attaches of the same connection in the same millisecond are
/// indistinguishable, which is harmless for the snapshot comparisons it
/// participates in.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Jitter a backoff step into `[base, 2 * base)` without a rand
/// dependency, seeding from the clock's sub-second nanos.
pub fn jittered(base: Duration) -> Duration {
    let frac = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as f64
        / (u32::MAX as f64); // [0.0, 1.0)
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + frac))
}
