//! Klavier line protocol
//!
//! Everything sent to the peer is ASCII text. Channel frames look like
//!
//! ```text
//! X:<v0>,<v1>,...,<vN-1>\n
//! ```
//!
//! with one decimal value per channel in index order. Discrete commands
//! (chat text, slider values) are written verbatim without a terminator.

use std::fmt::Write as _;

/// Prefix of a channel frame
pub const FRAME_PREFIX: &str = "X:";

/// Largest value accepted by the slider command
pub const SLIDER_MAX: u32 = 100;

/// Encode channel values as one frame
pub fn encode_frame(values: &[i32]) -> String {
    let mut line = String::with_capacity(FRAME_PREFIX.len() + values.len() * 4 + 1);
    line.push_str(FRAME_PREFIX);
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        // Writing into a String cannot fail
        let _ = write!(line, "{}", value);
    }
    line.push('\n');
    line
}

/// Frame with every channel at rest
pub fn zero_frame(channel_count: usize) -> String {
    encode_frame(&vec![0; channel_count])
}

/// Slider command payload
pub fn encode_slider(value: u32) -> String {
    value.to_string()
}
