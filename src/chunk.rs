//! Chunk-boundary geometry shared with the storage servers
//!
//! Chunk sizes grow by 128 KiB per chunk (128K, 256K, ... 1M) and plateau at
//! 1 MiB, so boundaries sit at 128K, 384K, 768K, 1280K, 1920K, 2688K, 3584K,
//! 4608K and every megabyte thereafter. The positions are a wire contract:
//! per-chunk MACs are only comparable across clients when every
//! implementation produces identical boundaries.

/// Base increment of the chunk-size progression.
pub const SEGSIZE: u64 = 131_072;

/// Chunk size at the plateau (8 * SEGSIZE = 1 MiB).
pub const MAX_CHUNK_SIZE: u64 = 8 * SEGSIZE;

/// File offset at which the progression plateaus (sum of 1..=8 segments).
const PLATEAU: u64 = 36 * SEGSIZE;

/// Returns the chunk boundary strictly greater than `pos`, clamped to `size`.
pub fn chunk_ceil(pos: u64, size: u64) -> u64 {
    let mut np = 0u64;
    for i in 1..=8u64 {
        np += i * SEGSIZE;
        if pos < np {
            return np.min(size);
        }
    }
    let np = PLATEAU + ((pos - PLATEAU) / MAX_CHUNK_SIZE + 1) * MAX_CHUNK_SIZE;
    np.min(size)
}

/// Returns the greatest chunk boundary less than or equal to `pos`.
/// Zero counts as a boundary.
pub fn chunk_floor(pos: u64) -> u64 {
    let mut np = 0u64;
    let mut cp = 0u64;
    for i in 1..=8u64 {
        np += i * SEGSIZE;
        if pos < np {
            return cp;
        }
        cp = np;
    }
    PLATEAU + (pos - PLATEAU) / MAX_CHUNK_SIZE * MAX_CHUNK_SIZE
}

/// Whether `pos` is a chunk start (or end-of-file for `size`).
pub fn is_chunk_boundary(pos: u64, size: u64) -> bool {
    pos == 0 || pos == size || chunk_floor(pos) == pos
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARIES: [u64; 8] = [
        131_072, 393_216, 786_432, 1_310_720, 1_966_080, 2_752_512, 3_670_016, 4_718_592,
    ];

    #[test]
    fn progression_boundaries() {
        let size = u64::MAX;
        let mut pos = 0;
        for expected in BOUNDARIES {
            pos = chunk_ceil(pos, size);
            assert_eq!(pos, expected);
        }
        // Plateau: 1 MiB chunks from here on
        assert_eq!(chunk_ceil(pos, size), pos + MAX_CHUNK_SIZE);
        assert_eq!(
            chunk_ceil(pos + MAX_CHUNK_SIZE, size),
            pos + 2 * MAX_CHUNK_SIZE
        );
    }

    #[test]
    fn ceil_is_strictly_greater_and_clamped() {
        assert_eq!(chunk_ceil(0, 65_536), 65_536);
        assert_eq!(chunk_ceil(131_071, 10 << 20), 131_072);
        assert_eq!(chunk_ceil(131_072, 10 << 20), 393_216);
        assert_eq!(chunk_ceil(9 << 20, 10 << 20), 10 << 20);
    }

    #[test]
    fn ceil_idempotence() {
        // chunk_ceil(chunk_ceil(x, n) - 1, n) == chunk_ceil(x, n)
        let n = 6_000_000u64;
        for x in (0..n).step_by(4_099) {
            let c = chunk_ceil(x, n);
            assert_eq!(chunk_ceil(c - 1, n), c, "x = {x}");
        }
    }

    #[test]
    fn floor_matches_ceil() {
        for x in (0..8_000_000u64).step_by(65_537) {
            let f = chunk_floor(x);
            assert!(f <= x);
            assert_eq!(chunk_ceil(f, u64::MAX), chunk_ceil(x, u64::MAX));
            assert_eq!(chunk_floor(chunk_ceil(x, u64::MAX)), chunk_ceil(x, u64::MAX));
        }
        assert_eq!(chunk_floor(0), 0);
        assert_eq!(chunk_floor(131_072), 131_072);
        assert_eq!(chunk_floor(131_073), 131_072);
        assert_eq!(chunk_floor(4_718_592 + 123), 4_718_592);
    }
}
