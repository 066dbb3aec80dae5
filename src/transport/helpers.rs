//! Helper functions for the transport module

use base64::Engine;
use rand::Rng;

/// Generate a random WebSocket key
pub(super) fn generate_ws_key() -> String {
    let mut rng = rand::thread_rng();
    let mut key = [0u8; 16];
    rng.fill(&mut key);
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Uniform sample in [0, 1) for reconnect jitter
pub(super) fn jitter_sample() -> f64 {
    rand::thread_rng().gen::<f64>()
}
