pub const MAX_INPUT_SIZE: usize = 256 * 1024;

/// `data` capped to [`MAX_INPUT_SIZE`] so pathological inputs cannot OOM the
/// harness.
#[inline]
pub fn capped(data: &[u8]) -> &[u8] {
    &data[..data.len().min(MAX_INPUT_SIZE)]
}
