use umbra_pow::difficulty::{
    compact_to_target, hash_meets_target, target_to_compact, CompactError,
};

#[test]
fn well_known_bits_survive_a_roundtrip() {
    for bits in [0x1d00ffff, 0x1e0fffff, 0x207fffff, 0x1b04864c] {
        let target = compact_to_target(bits).expect("target");
        assert_eq!(target_to_compact(&target), bits, "bits {bits:#x}");
    }
}

#[test]
fn target_bytes_are_little_endian() {
    // 0x207fffff places 0x7fffff in the top three bytes of the target.
    let target = compact_to_target(0x207fffff).expect("target");
    assert!(target[..29].iter().all(|byte| *byte == 0));
    assert_eq!(&target[29..], &[0xff, 0xff, 0x7f]);
}

#[test]
fn sign_bit_and_oversized_exponent_are_rejected() {
    assert_eq!(compact_to_target(0x01800000), Err(CompactError::Negative));
    assert_eq!(compact_to_target(0xff00ffff), Err(CompactError::Overflow));
}

#[test]
fn target_comparison_is_inclusive() {
    let target = compact_to_target(0x1e0fffff).expect("target");
    assert!(hash_meets_target(&target, &target));
    assert!(hash_meets_target(&[0u8; 32], &target));
    assert!(!hash_meets_target(&[0xff; 32], &target));
}
