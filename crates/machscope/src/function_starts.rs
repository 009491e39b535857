//! `LC_FUNCTION_STARTS` decoding.
//!
//! The table is a run of ULEB128 deltas. The first delta is relative to the
//! image base (the `__TEXT` vmaddr), each later one to the previous
//! function. A zero delta ends the table; what follows is padding.

use crate::{Error, Result};

/// Decode one ULEB128 value starting at `*pos`.
///
/// Returns `None` if the input ends before the last byte of the value.
pub(crate) fn read_uleb128(bytes: &[u8], pos: &mut usize) -> Option<Result<u64>> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        let low = (byte & 0x7f) as u64;
        if shift >= 64 || (shift == 63 && low > 1) {
            return Some(Err(Error::TruncatedFunctionStarts(format!(
                "varint ending at {:#x} is wider than 64 bits",
                *pos
            ))));
        }
        value |= low << shift;
        if byte & 0x80 == 0 {
            return Some(Ok(value));
        }
        shift += 7;
    }
}

/// Decode a function starts table into absolute addresses.
///
/// # Errors
///
/// Returns [`Error::TruncatedFunctionStarts`] if the stream ends inside a
/// varint, a varint overflows 64 bits, or an address overflows.
///
/// # Examples
///
/// ```
/// let starts = machscope::function_starts::decode(&[4, 4, 0], 0x1000)?;
/// assert_eq!(starts, vec![0x1004, 0x1008]);
/// # Ok::<(), machscope::Error>(())
/// ```
pub fn decode(bytes: &[u8], base: u64) -> Result<Vec<u64>> {
    let mut starts = Vec::new();
    let mut address = base;
    let mut pos = 0;
    while pos < bytes.len() {
        let start = pos;
        let delta = read_uleb128(bytes, &mut pos).ok_or_else(|| {
            Error::TruncatedFunctionStarts(format!(
                "stream of {} bytes ends inside the varint at {:#x}",
                bytes.len(),
                start
            ))
        })??;
        if delta == 0 {
            break;
        }
        address = address.checked_add(delta).ok_or_else(|| {
            Error::TruncatedFunctionStarts(format!("address overflows after {:#x}", address))
        })?;
        starts.push(address);
    }
    tracing::debug!(count = starts.len(), "decoded function starts");
    Ok(starts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_deltas() {
        assert_eq!(decode(&[4, 4, 0], 0x1000).unwrap(), vec![0x1004, 0x1008]);
    }

    #[test]
    fn test_multibyte_delta_and_padding() {
        // 0x4000 = 0x80 0x80 0x01
        let bytes = [0x80, 0x80, 0x01, 0x10, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            decode(&bytes, 0x1_0000_0000).unwrap(),
            vec![0x1_0000_4000, 0x1_0000_4010]
        );
    }

    #[test]
    fn test_missing_terminator_is_fine() {
        assert_eq!(decode(&[8], 0).unwrap(), vec![8]);
        assert!(decode(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_varint() {
        let err = decode(&[4, 0x80], 0x1000).unwrap_err();
        assert!(matches!(err, Error::TruncatedFunctionStarts(_)));
    }

    #[test]
    fn test_overlong_varint() {
        let bytes = [0xff; 11];
        assert!(matches!(decode(&bytes, 0), Err(Error::TruncatedFunctionStarts(_))));
    }

    #[test]
    fn test_address_overflow() {
        let bytes = [0x7f, 0];
        assert!(matches!(decode(&bytes, u64::MAX - 1), Err(Error::TruncatedFunctionStarts(_))));
    }

    #[test]
    fn test_strictly_increasing() {
        let bytes = [1, 2, 0x83, 0x01, 5, 0];
        let starts = decode(&bytes, 0x4000).unwrap();
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
    }
}
