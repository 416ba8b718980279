//! Byte-exact round-trip oracle.

use crate::{MemcopyError, Result};

/// Compare two buffers byte for byte, in increasing index order.
///
/// Stops at the first differing index and reports it with both bytes.
/// Buffers of different length are a `SizeMismatch`; empty buffers pass.
pub fn verify_bytes(expected: &[u8], actual: &[u8]) -> Result<()> {
    if expected.len() != actual.len() {
        return Err(MemcopyError::SizeMismatch {
            expected: expected.len() as u64,
            got: actual.len() as u64,
        });
    }
    match expected.iter().zip(actual).position(|(e, a)| e != a) {
        Some(i) => Err(MemcopyError::Mismatch {
            index: i as u64,
            expected: expected[i],
            actual: actual[i],
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_passes() {
        verify_bytes(&[1, 2, 3], &[1, 2, 3]).unwrap();
        verify_bytes(&[], &[]).unwrap();
    }

    #[test]
    fn test_first_mismatch_reported() {
        let err = verify_bytes(&[0, 1, 2, 3], &[0, 9, 2, 7]).unwrap_err();
        assert!(matches!(
            err,
            MemcopyError::Mismatch {
                index: 1,
                expected: 0x01,
                actual: 0x09
            }
        ));
        assert_eq!(err.to_string(), "error at 1, expected 01, but get 09");
    }

    #[test]
    fn test_length_mismatch() {
        assert!(matches!(
            verify_bytes(&[1, 2], &[1]),
            Err(MemcopyError::SizeMismatch {
                expected: 2,
                got: 1
            })
        ));
    }
}
