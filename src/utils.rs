//! Utility functions for rtcproxy

use rand::{distributions::Alphanumeric, Rng};

/// Generate a random string of the specified length
pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Generate a channel id.
///
/// Channel ids double as data-channel labels and must be unique across all
/// live channels of both peers; 16 alphanumeric characters (~95 bits) is
/// collision-resistant at any realistic channel count.
pub fn generate_channel_id() -> String {
    random_string(16)
}
