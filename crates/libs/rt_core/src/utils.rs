/// Rounds `size` up to the next multiple of `alignment`, which must be a power of two.
pub const fn compute_aligned_size(size: u64, alignment: u64) -> u64 {
    (size + (alignment - 1)) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligns_up_to_power_of_two() {
        assert_eq!(compute_aligned_size(0, 32), 0);
        assert_eq!(compute_aligned_size(1, 32), 32);
        assert_eq!(compute_aligned_size(32, 32), 32);
        assert_eq!(compute_aligned_size(72, 32), 96);
        assert_eq!(compute_aligned_size(112, 256), 256);
    }
}
