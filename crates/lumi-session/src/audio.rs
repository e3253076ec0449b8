//! Microphone sample handling.
//!
//! The capture pipeline hands over either floating-point or 16-bit integer
//! sample buffers; the wire format wants normalized f32 arrays. Conversion
//! mirrors the usual PCM16 normalization (divide by 32768, so i16::MIN maps
//! exactly to -1.0).

/// A client-native buffer of microphone samples.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    F32(Vec<f32>),
    I16(Vec<i16>),
}

impl SampleBuffer {
    /// Normalizes the buffer to f32 samples in [-1.0, 1.0].
    pub fn into_f32(self) -> Vec<f32> {
        match self {
            SampleBuffer::F32(samples) => samples,
            SampleBuffer::I16(samples) => convert_i16_to_f32(&samples),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SampleBuffer::F32(samples) => samples.len(),
            SampleBuffer::I16(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<f32>> for SampleBuffer {
    fn from(samples: Vec<f32>) -> Self {
        SampleBuffer::F32(samples)
    }
}

impl From<Vec<i16>> for SampleBuffer {
    fn from(samples: Vec<i16>) -> Self {
        SampleBuffer::I16(samples)
    }
}

/// Converts a slice of i16 samples to a vector of normalized f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_convert_i16_to_f32() {
        let input = vec![i16::MAX, i16::MIN, 0i16, 16384i16];
        let result = convert_i16_to_f32(&input);

        assert_eq!(result.len(), 4);
        assert_abs_diff_eq!(result[0], i16::MAX as f32 / 32768.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[2], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[3], 0.5, epsilon = 0.0001);

        let result = convert_i16_to_f32(&[]);
        assert!(result.is_empty());
    }

    #[test]
    fn test_sample_buffer_normalization() {
        let buffer = SampleBuffer::from(vec![16384i16, -32768i16]);
        assert_eq!(buffer.len(), 2);
        let samples = buffer.into_f32();
        assert_abs_diff_eq!(samples[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(samples[1], -1.0, epsilon = 0.0001);

        let buffer = SampleBuffer::from(vec![0.25f32, -0.75f32]);
        assert_eq!(buffer.into_f32(), vec![0.25, -0.75]);
    }

    #[test]
    fn test_empty_buffer() {
        assert!(SampleBuffer::F32(Vec::new()).is_empty());
        assert!(!SampleBuffer::I16(vec![1]).is_empty());
    }
}
