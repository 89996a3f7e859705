use std::time::{SystemTime, UNIX_EPOCH};

/// Mixes 64 bits down to 32 with an xorshift-rotate round.
fn mix_bits(x: u64) -> u32 {
    let x = x ^ 0xA0B1_C2D3;
    let xor_shifted = (((x >> 18) ^ x) >> 27) as u32;
    let rot = (x >> 59) as u32;
    xor_shifted.rotate_right(rot) ^ 0x1234_5678
}

/// The deterministic mixing function behind the connection handshake.
///
/// A server challenges with `scramble(seed)` and expects
///  `scramble(challenge)` back; any peer speaking a different protocol
///  version fails the exchange. The additive offset encodes the protocol
///  version, so bumping it invalidates handshakes from older peers. This is
///  an obfuscation check, not a cryptographic one.
pub fn scramble(input: u64) -> u64 {
    const LARGE_PRIME: u64 = 6364136223846793005;
    const OFFSET: u64 = 512;

    let once = (mix_bits(input) as u64)
        .wrapping_mul(LARGE_PRIME)
        .wrapping_add(OFFSET);
    (mix_bits(once) as u64)
        .wrapping_mul(LARGE_PRIME)
        .wrapping_add(OFFSET)
}

/// A fresh challenge for one handshake, seeded from the wall clock so every
///  connection gets a different value.
pub(crate) fn fresh_challenge() -> u64 {
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    scramble(now_ns)
}
