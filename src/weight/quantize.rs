//! Row-wise Q8_0 quantization: each row of a tensor is stored as `i8` values
//! plus one `f32` scale, so dequantizing a row costs one multiply per
//! element and no branching.

/// A single quantized row: 8-bit values plus the scale that recovers the
/// original `f32` magnitude.
#[derive(Debug, Clone)]
pub struct QuantizedRow {
    pub scale: f32,
    pub values: Vec<i8>,
}

/// Quantize one row of `f32` values into Q8_0 form.
///
/// The scale is `max(|x|) / 127`; an all-zero row gets a scale of `0.0` so
/// dequantization yields exact zeros back.
pub fn quantize_row(row: &[f32]) -> QuantizedRow {
    let max_abs = row.iter().fold(0f32, |acc, &x| acc.max(x.abs()));
    if max_abs == 0.0 {
        return QuantizedRow {
            scale: 0.0,
            values: vec![0i8; row.len()],
        };
    }
    let scale = max_abs / 127.0;
    let values = row
        .iter()
        .map(|&x| (x / scale).round().clamp(-127.0, 127.0) as i8)
        .collect();
    QuantizedRow { scale, values }
}

pub fn dequantize_row(row: &QuantizedRow, out: &mut [f32]) {
    for (dst, &v) in out.iter_mut().zip(row.values.iter()) {
        *dst = v as f32 * row.scale;
    }
}

/// Serialize a Q8_0 row to bytes: 4-byte little-endian scale followed by
/// one byte per value.
pub fn encode_row(row: &QuantizedRow) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + row.values.len());
    out.extend_from_slice(&row.scale.to_le_bytes());
    out.extend(row.values.iter().map(|&v| v as u8));
    out
}

pub fn decode_row(bytes: &[u8]) -> QuantizedRow {
    let scale = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let values = bytes[4..].iter().map(|&b| b as i8).collect();
    QuantizedRow { scale, values }
}

/// Quantize a full `rows x cols` matrix in row-major order, returning one
/// encoded buffer per row (matching the tensor directory's `row_crc` model —
/// each row is independently checksummed by the caller).
pub fn quantize_matrix(data: &[f32], cols: usize) -> Vec<Vec<u8>> {
    data.chunks(cols).map(|row| encode_row(&quantize_row(row))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_dequantize_roundtrip_within_tolerance() {
        let row = vec![1.0f32, -2.0, 3.5, 0.0, -127.0, 127.0];
        let q = quantize_row(&row);
        let mut out = vec![0f32; row.len()];
        dequantize_row(&q, &mut out);
        for (a, b) in row.iter().zip(out.iter()) {
            assert!((a - b).abs() <= 1.1, "a={a} b={b}");
        }
    }

    #[test]
    fn test_zero_row_has_zero_scale() {
        let q = quantize_row(&[0.0, 0.0, 0.0]);
        assert_eq!(q.scale, 0.0);
        assert!(q.values.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_row_byte_roundtrip() {
        let q = quantize_row(&[5.0, -5.0, 2.5]);
        let bytes = encode_row(&q);
        let decoded = decode_row(&bytes);
        assert_eq!(decoded.scale, q.scale);
        assert_eq!(decoded.values, q.values);
    }
}
