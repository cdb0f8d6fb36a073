/// Scale a channel count by the width factor, truncating toward zero.
pub fn scale_channels(num_channels: usize, scale: f64) -> usize {
    (num_channels as f64 * scale) as usize
}

/// Whether scaling drops a fractional part of the channel count.
pub fn is_truncated(num_channels: usize, scale: f64) -> bool {
    num_channels as f64 * scale != scale_channels(num_channels, scale) as f64
}
