use crate::error::PicError;

/// Compute the log-base-two of the next power of two: 8 -> 3, 9 -> 4.
///
pub fn ceil_log2(x: usize) -> usize {
    let mut n = 0;
    while 1 << n < x {
        n += 1
    }
    n
}

/// Pack a slice of doubles into a little-endian byte buffer.
///
pub fn f64s_to_bytes(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Unpack a little-endian byte buffer produced by [`f64s_to_bytes`].
///
pub fn bytes_to_f64s(bytes: &[u8]) -> Result<Vec<f64>, PicError> {
    if bytes.len() % 8 != 0 {
        return Err(PicError::Comm(format!(
            "received {} bytes, which is not a whole number of doubles",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(c);
            f64::from_le_bytes(buf)
        })
        .collect())
}

/// Combine two packed vectors element-wise.
///
pub fn zip_f64_bytes<F>(a: &[u8], b: &[u8], f: F) -> Result<Vec<u8>, PicError>
where
    F: Fn(f64, f64) -> f64,
{
    let a = bytes_to_f64s(a)?;
    let b = bytes_to_f64s(b)?;
    if a.len() != b.len() {
        return Err(PicError::Comm(format!(
            "element-wise reduction over vectors of length {} and {}",
            a.len(),
            b.len()
        )));
    }
    let c: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| f(*x, *y)).collect();
    Ok(f64s_to_bytes(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_log2_rounds_up() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }

    #[test]
    fn packed_doubles_survive_the_trip() {
        let v = vec![1.5, -0.0, f64::MAX, 1.0e-300];
        assert_eq!(bytes_to_f64s(&f64s_to_bytes(&v)).unwrap(), v);
        assert!(bytes_to_f64s(&[0u8; 7]).is_err());
    }
}
