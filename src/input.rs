// WAV input: minimal RIFF parsing (enough to locate the audio data and
// its format) and conversion to interleaved f64 normalized to [-1, 1].
// Compressed containers are somebody else's job; this reader only
// speaks PCM and IEEE float WAV.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::{MeterError, MeterResult};

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

#[derive(Debug, Clone, Copy)]
pub struct AudioMetadata {
    pub sample_rate: u32,
    pub channels: usize,
    pub frames: u64,
    pub duration_seconds: f64,
}

pub struct DecodedAudio {
    /// Interleaved frames, 1.0 == 0 dBFS.
    pub samples: Vec<f64>,
    pub metadata: AudioMetadata,
}

pub fn validate_extension(path: &Path) -> MeterResult<()> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if ext != "wav" {
        return Err(MeterError::InvalidArgument(format!(
            "unsupported file extension \"{ext}\": only .wav input is decoded in-process"
        )));
    }
    Ok(())
}

fn read_u16le<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32le<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

struct WavFormat {
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
}

pub fn decode_wav(path: &Path) -> MeterResult<DecodedAudio> {
    let file = File::open(path)
        .map_err(|e| MeterError::DecoderFailure(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let mut id = [0u8; 4];
    reader
        .read_exact(&mut id)
        .map_err(|e| MeterError::DecoderFailure(e.to_string()))?;
    if &id != b"RIFF" {
        return Err(MeterError::DecoderFailure(
            "not a WAV file (missing RIFF chunk)".to_string(),
        ));
    }
    let _riff_size = read_u32le(&mut reader).map_err(decode_err)?;
    reader.read_exact(&mut id).map_err(decode_err)?;
    if &id != b"WAVE" {
        return Err(MeterError::DecoderFailure(
            "not a WAV file (missing WAVE tag)".to_string(),
        ));
    }

    // Walk chunks; format must precede data.
    let mut format: Option<WavFormat> = None;
    loop {
        if reader.read_exact(&mut id).is_err() {
            return Err(MeterError::DecoderFailure(
                "WAV has no data chunk".to_string(),
            ));
        }
        let chunk_size = read_u32le(&mut reader).map_err(decode_err)? as u64;

        match &id {
            b"fmt " => {
                let format_tag = read_u16le(&mut reader).map_err(decode_err)?;
                let channels = read_u16le(&mut reader).map_err(decode_err)?;
                let sample_rate = read_u32le(&mut reader).map_err(decode_err)?;
                let _byte_rate = read_u32le(&mut reader).map_err(decode_err)?;
                let _block_align = read_u16le(&mut reader).map_err(decode_err)?;
                let bits_per_sample = read_u16le(&mut reader).map_err(decode_err)?;

                let mut effective_tag = format_tag;
                let mut consumed = 16u64;
                if format_tag == WAVE_FORMAT_EXTENSIBLE && chunk_size >= 26 {
                    let _cb_size = read_u16le(&mut reader).map_err(decode_err)?;
                    let _valid_bits = read_u16le(&mut reader).map_err(decode_err)?;
                    let _channel_mask = read_u32le(&mut reader).map_err(decode_err)?;
                    // First two GUID bytes carry the wrapped format tag.
                    effective_tag = read_u16le(&mut reader).map_err(decode_err)?;
                    consumed += 10;
                }
                skip_padded(&mut reader, chunk_size, consumed)?;

                format = Some(WavFormat {
                    format_tag: effective_tag,
                    channels,
                    sample_rate,
                    bits_per_sample,
                });
            }
            b"data" => {
                let format = format.ok_or_else(|| {
                    MeterError::DecoderFailure("data chunk before fmt chunk".to_string())
                })?;
                return read_data(&mut reader, &format, chunk_size);
            }
            _ => {
                skip_padded(&mut reader, chunk_size, 0)?;
            }
        }
    }
}

fn decode_err(e: io::Error) -> MeterError {
    MeterError::DecoderFailure(e.to_string())
}

// Chunks are word-aligned; the pad byte is not part of the size field.
fn skip_padded<R: Read + Seek>(reader: &mut R, chunk_size: u64, consumed: u64) -> MeterResult<()> {
    let remaining = chunk_size.saturating_sub(consumed);
    let pad = chunk_size % 2;
    reader
        .seek(SeekFrom::Current((remaining + pad) as i64))
        .map_err(decode_err)?;
    Ok(())
}

fn read_data<R: Read>(
    reader: &mut R,
    format: &WavFormat,
    data_size: u64,
) -> MeterResult<DecodedAudio> {
    if format.channels == 0 {
        return Err(MeterError::DecoderFailure(
            "WAV reports zero channels".to_string(),
        ));
    }
    let bytes_per_sample = (format.bits_per_sample as usize).div_ceil(8);
    let supported = matches!(
        (format.format_tag, format.bits_per_sample),
        (WAVE_FORMAT_PCM, 16) | (WAVE_FORMAT_PCM, 24) | (WAVE_FORMAT_PCM, 32)
            | (WAVE_FORMAT_IEEE_FLOAT, 32)
            | (WAVE_FORMAT_IEEE_FLOAT, 64)
    );
    if !supported {
        return Err(MeterError::DecoderFailure(format!(
            "unsupported WAV encoding: format tag {:#06x}, {} bits",
            format.format_tag, format.bits_per_sample
        )));
    }

    let mut raw = Vec::new();
    reader
        .take(data_size)
        .read_to_end(&mut raw)
        .map_err(decode_err)?;
    if raw.len() as u64 != data_size {
        return Err(MeterError::DecoderFailure(format!(
            "data chunk truncated: expected {data_size} bytes, read {}",
            raw.len()
        )));
    }

    let channels = format.channels as usize;
    let total_samples = raw.len() / bytes_per_sample;
    if total_samples % channels != 0 {
        return Err(MeterError::DecoderFailure(
            "sample data not divisible by channel count".to_string(),
        ));
    }

    let mut samples = Vec::with_capacity(total_samples);
    match (format.format_tag, format.bits_per_sample) {
        (WAVE_FORMAT_PCM, 16) => {
            for chunk in raw.chunks_exact(2) {
                let v = i16::from_le_bytes([chunk[0], chunk[1]]);
                samples.push(v as f64 / 32_768.0);
            }
        }
        (WAVE_FORMAT_PCM, 24) => {
            for chunk in raw.chunks_exact(3) {
                let v = i32::from_le_bytes([0, chunk[0], chunk[1], chunk[2]]) >> 8;
                samples.push(v as f64 / 8_388_608.0);
            }
        }
        (WAVE_FORMAT_PCM, 32) => {
            for chunk in raw.chunks_exact(4) {
                let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                samples.push(v as f64 / 2_147_483_648.0);
            }
        }
        (WAVE_FORMAT_IEEE_FLOAT, 32) => {
            for chunk in raw.chunks_exact(4) {
                let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                samples.push(v as f64);
            }
        }
        (WAVE_FORMAT_IEEE_FLOAT, 64) => {
            for chunk in raw.chunks_exact(8) {
                let mut b = [0u8; 8];
                b.copy_from_slice(chunk);
                samples.push(f64::from_le_bytes(b));
            }
        }
        _ => unreachable!("filtered above"),
    }

    let frames = (samples.len() / channels) as u64;
    Ok(DecodedAudio {
        samples,
        metadata: AudioMetadata {
            sample_rate: format.sample_rate,
            channels,
            frames,
            duration_seconds: frames as f64 / format.sample_rate as f64,
        },
    })
}

/// Linear-interpolation resampler for rates without an M-weighting
/// table. Deliberately trivial; anything better belongs upstream.
pub fn resample_linear(
    samples: &[f64],
    from_rate: u32,
    to_rate: u32,
    channels: usize,
) -> MeterResult<Vec<f64>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    if from_rate == 0 || to_rate == 0 || channels == 0 {
        return Err(MeterError::InvalidArgument(
            "invalid resampling parameters".to_string(),
        ));
    }
    let input_frames = samples.len() / channels;
    if input_frames == 0 {
        return Err(MeterError::InsufficientData);
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_frames = (input_frames as f64 * ratio) as usize;
    let mut out = vec![0.0f64; output_frames * channels];

    for out_frame in 0..output_frames {
        let src_pos = out_frame as f64 / ratio;
        let mut src_frame = src_pos as usize;
        let mut frac = src_pos - src_frame as f64;
        if src_frame >= input_frames - 1 {
            src_frame = input_frames.saturating_sub(2);
            frac = 1.0;
        }
        for ch in 0..channels {
            let s1 = samples[src_frame * channels + ch];
            let s2 = samples[(src_frame + 1).min(input_frames - 1) * channels + ch];
            out[out_frame * channels + ch] = s1 + frac * (s2 - s1);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_wav_f32(path: &Path, sample_rate: u32, channels: u16, frames: &[f32]) {
        let data_size = (frames.len() * 4) as u32;
        let mut f = File::create(path).unwrap();
        f.write_all(b"RIFF").unwrap();
        f.write_all(&(36 + data_size).to_le_bytes()).unwrap();
        f.write_all(b"WAVE").unwrap();
        f.write_all(b"fmt ").unwrap();
        f.write_all(&16u32.to_le_bytes()).unwrap();
        f.write_all(&3u16.to_le_bytes()).unwrap(); // IEEE float
        f.write_all(&channels.to_le_bytes()).unwrap();
        f.write_all(&sample_rate.to_le_bytes()).unwrap();
        f.write_all(&(sample_rate * channels as u32 * 4).to_le_bytes())
            .unwrap();
        f.write_all(&(channels * 4).to_le_bytes()).unwrap();
        f.write_all(&32u16.to_le_bytes()).unwrap();
        f.write_all(b"data").unwrap();
        f.write_all(&data_size.to_le_bytes()).unwrap();
        for s in frames {
            f.write_all(&s.to_le_bytes()).unwrap();
        }
    }

    fn write_wav_i16(path: &Path, sample_rate: u32, channels: u16, frames: &[i16]) {
        let data_size = (frames.len() * 2) as u32;
        let mut f = File::create(path).unwrap();
        f.write_all(b"RIFF").unwrap();
        f.write_all(&(36 + data_size).to_le_bytes()).unwrap();
        f.write_all(b"WAVE").unwrap();
        f.write_all(b"fmt ").unwrap();
        f.write_all(&16u32.to_le_bytes()).unwrap();
        f.write_all(&1u16.to_le_bytes()).unwrap(); // PCM
        f.write_all(&channels.to_le_bytes()).unwrap();
        f.write_all(&sample_rate.to_le_bytes()).unwrap();
        f.write_all(&(sample_rate * channels as u32 * 2).to_le_bytes())
            .unwrap();
        f.write_all(&(channels * 2).to_le_bytes()).unwrap();
        f.write_all(&16u16.to_le_bytes()).unwrap();
        f.write_all(b"data").unwrap();
        f.write_all(&data_size.to_le_bytes()).unwrap();
        for s in frames {
            f.write_all(&s.to_le_bytes()).unwrap();
        }
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("leqm_input_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn float_wav_round_trips() {
        let path = temp_path("float.wav");
        write_wav_f32(&path, 48_000, 2, &[0.5, -0.5, 0.25, -0.25]);
        let decoded = decode_wav(&path).unwrap();
        assert_eq!(decoded.metadata.sample_rate, 48_000);
        assert_eq!(decoded.metadata.channels, 2);
        assert_eq!(decoded.metadata.frames, 2);
        assert!((decoded.samples[0] - 0.5).abs() < 1e-7);
        assert!((decoded.samples[3] + 0.25).abs() < 1e-7);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn pcm16_scales_to_unit_range() {
        let path = temp_path("pcm16.wav");
        write_wav_i16(&path, 44_100, 1, &[i16::MIN, 0, i16::MAX]);
        let decoded = decode_wav(&path).unwrap();
        assert_eq!(decoded.metadata.frames, 3);
        assert!((decoded.samples[0] + 1.0).abs() < 1e-9);
        assert_eq!(decoded.samples[1], 0.0);
        assert!((decoded.samples[2] - (32_767.0 / 32_768.0)).abs() < 1e-9);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn garbage_is_a_decoder_failure() {
        let path = temp_path("garbage.wav");
        std::fs::write(&path, b"not a riff file at all").unwrap();
        assert!(matches!(
            decode_wav(&path),
            Err(MeterError::DecoderFailure(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn extension_gate() {
        assert!(validate_extension(Path::new("x.wav")).is_ok());
        assert!(validate_extension(Path::new("x.WAV")).is_ok());
        assert!(validate_extension(Path::new("x.mp3")).is_err());
        assert!(validate_extension(Path::new("x")).is_err());
    }

    #[test]
    fn resample_preserves_dc_and_length_ratio() {
        let samples = vec![0.25f64; 1000];
        let out = resample_linear(&samples, 32_000, 48_000, 1).unwrap();
        assert_eq!(out.len(), 1500);
        for v in &out {
            assert!((v - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        let out = resample_linear(&samples, 48_000, 48_000, 1).unwrap();
        assert_eq!(out, samples);
    }
}
