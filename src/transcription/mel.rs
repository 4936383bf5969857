//! Slaney-style mel filter bank, matching the filters Whisper was trained with
//! (`librosa.filters.mel(sr=16000, n_fft=400, n_mels=80|128)`).

const MIN_LOG_HZ: f64 = 1000.0;
const LINEAR_SPACING: f64 = 200.0 / 3.0;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz < MIN_LOG_HZ {
        hz / LINEAR_SPACING
    } else {
        MIN_LOG_HZ / LINEAR_SPACING + (hz / MIN_LOG_HZ).ln() / log_step()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    let min_log_mel = MIN_LOG_HZ / LINEAR_SPACING;
    if mel < min_log_mel {
        mel * LINEAR_SPACING
    } else {
        MIN_LOG_HZ * (log_step() * (mel - min_log_mel)).exp()
    }
}

/// Row-major `n_mels x (n_fft / 2 + 1)` filter weights, area-normalized.
pub fn filter_bank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| nyquist * k as f64 / (n_freqs - 1) as f64)
        .collect();

    let max_mel = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let norm = 2.0 / (right - left);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - left) / (center - left);
            let falling = (right - freq) / (right - center);
            let weight = rising.min(falling).max(0.0);
            filters[m * n_freqs + k] = (weight * norm) as f32;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_scale_roundtrip() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_filter_bank_shape() {
        let filters = filter_bank(16000, 400, 80);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|&w| w >= 0.0));

        // Every filter covers at least one FFT bin
        for m in 0..80 {
            let row = &filters[m * 201..(m + 1) * 201];
            assert!(row.iter().any(|&w| w > 0.0), "filter {} is empty", m);
        }
    }
}
