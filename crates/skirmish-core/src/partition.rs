//! Record key to partition assignment.

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable partition for `key` among `partitions`.
///
/// The hash does not depend on the process or the Rust version, so a key
/// lands on the same partition (and the same on-disk window) across
/// restarts. Zero partitions maps everything to 0.
pub fn partition_for(key: &[u8], partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let hash = key.iter().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    });
    let partition = hash.wrapping_rem(u64::from(partitions));
    u32::try_from(partition).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_is_stable() {
        let first = partition_for(b"round-42", 8);
        for _ in 0..10 {
            assert_eq!(partition_for(b"round-42", 8), first);
        }
        assert!(first < 8);
    }

    #[test]
    fn single_partition_takes_everything() {
        assert_eq!(partition_for(b"anything", 1), 0);
        assert_eq!(partition_for(b"anything", 0), 0);
    }

    #[test]
    fn keys_spread_across_partitions() {
        let mut seen = [false; 4];
        for i in 0..64 {
            let p = partition_for(format!("round-{i}").as_bytes(), 4);
            if let Some(slot) = seen.get_mut(usize::try_from(p).unwrap_or(0)) {
                *slot = true;
            }
        }
        assert!(seen.iter().all(|s| *s));
    }
}
