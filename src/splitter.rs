//! Treatment selection: maps a hashed key into a bucket in [1, 100] and walks
//! condition partitions until the cumulative size covers the bucket.

use crate::hashing::{hash_key, HashAlgorithm};
use crate::types::flag::Partition;

/// Sentinel treatment returned on any failure or indeterminate state.
pub const CONTROL: &str = "control";

/// Bucket for a key/seed pair, in [1, 100].
pub fn bucket(key: &str, seed: i64, algo: HashAlgorithm) -> u8 {
    bucket_for_hash(hash_key(key, seed, algo))
}

fn bucket_for_hash(key_hash: i64) -> u8 {
    (key_hash.abs() % 100 + 1) as u8
}

/// Treatment for a key given a seed and the condition's partitions.
///
/// Returns CONTROL when there are no partitions. When a single partition
/// covers the full range the hash is skipped entirely.
pub fn treatment(key: &str, seed: i64, partitions: &[Partition], algo: HashAlgorithm) -> String {
    if partitions.is_empty() {
        return CONTROL.to_string();
    }

    if partitions.len() == 1 && partitions[0].size == 100 {
        return partitions[0].treatment.clone();
    }

    treatment_for_bucket(bucket(key, seed, algo), partitions)
}

/// First partition whose cumulative size reaches the bucket wins.
pub fn treatment_for_bucket(bucket: u8, partitions: &[Partition]) -> String {
    let mut covered: u32 = 0;
    for partition in partitions {
        covered += u32::from(partition.size);
        if covered >= u32::from(bucket) {
            return partition.treatment.clone();
        }
    }
    CONTROL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(sizes: &[(&str, u8)]) -> Vec<Partition> {
        sizes
            .iter()
            .map(|(t, s)| Partition { treatment: t.to_string(), size: *s })
            .collect()
    }

    #[test]
    fn test_bucket_range() {
        for i in 0..1000 {
            let key = format!("key-{}", i);
            let b = bucket(&key, 123, HashAlgorithm::Murmur);
            assert!((1..=100).contains(&b), "bucket {} out of range for {}", b, key);
            let b = bucket(&key, -1, HashAlgorithm::Legacy);
            assert!((1..=100).contains(&b));
        }
    }

    #[test]
    fn test_empty_partitions_yield_control() {
        assert_eq!(treatment("any", 123, &[], HashAlgorithm::Murmur), CONTROL);
    }

    #[test]
    fn test_single_full_partition_fast_path() {
        let parts = partitions(&[("on", 100)]);
        // Every key lands on the only partition, regardless of hash.
        for key in ["a", "b", "zzz", ""] {
            assert_eq!(treatment(key, 99, &parts, HashAlgorithm::Murmur), "on");
        }
    }

    #[test]
    fn test_treatment_for_bucket_boundaries() {
        let parts = partitions(&[("on", 60), ("off", 40)]);
        assert_eq!(treatment_for_bucket(1, &parts), "on");
        assert_eq!(treatment_for_bucket(60, &parts), "on");
        assert_eq!(treatment_for_bucket(61, &parts), "off");
        assert_eq!(treatment_for_bucket(100, &parts), "off");
    }

    #[test]
    fn test_treatment_matches_bucket_walk() {
        let parts = partitions(&[("on", 60), ("off", 40)]);
        let key = "user-42";
        let b = bucket(key, 123, HashAlgorithm::Murmur);
        let expected = if b <= 60 { "on" } else { "off" };
        assert_eq!(treatment(key, 123, &parts, HashAlgorithm::Murmur), expected);
    }

    #[test]
    fn test_uncovered_bucket_falls_back_to_control() {
        // Malformed partition list not summing to 100; walk falls through.
        let parts = partitions(&[("on", 10)]);
        assert_eq!(treatment_for_bucket(50, &parts), CONTROL);
    }
}
