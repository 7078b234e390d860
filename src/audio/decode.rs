//! Asset decoding via Symphonia
//!
//! Decodes a whole in-memory file (WAV, FLAC, MP3, AAC, Ogg Vorbis) into one
//! interleaved f32 buffer.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::audio::buffer::AudioBuffer;
use crate::audio::engine::AssetDecoder;
use crate::error::AudioError;

/// Decoder for common compressed and PCM formats
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl AssetDecoder for SymphoniaDecoder {
    fn decode(&self, file_name: &str, bytes: &[u8]) -> Result<AudioBuffer, AudioError> {
        let cursor = Cursor::new(bytes.to_vec());
        let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

        // Build a hint from the file extension
        let mut hint = Hint::new();
        if let Some(ext) = std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
        {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| AudioError::UnsupportedFormat(format!("{}: {}", file_name, e)))?;

        let mut format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::NoAudioTrack(file_name.to_string()))?;

        let track_id = track.id;
        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| AudioError::UnsupportedFormat(format!("Codec init failed: {}", e)))?;

        let mut samples: Vec<f32> = Vec::new();
        let mut channels: u16 = track.codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);
        let mut sample_rate: u32 = track.codec_params.sample_rate.unwrap_or(0);
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(AudioError::Decode(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // Corrupt packet, skip it
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("Skipping undecodable packet in {}: {}", file_name, e);
                    continue;
                }
                Err(e) => return Err(AudioError::Decode(e.to_string())),
            };

            let spec = *decoded.spec();
            channels = spec.channels.count() as u16;
            sample_rate = spec.rate;

            let buf = sample_buf
                .get_or_insert_with(|| SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            if buf.capacity() < decoded.capacity() * spec.channels.count() {
                *buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            }
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }

        if samples.is_empty() || channels == 0 || sample_rate == 0 {
            return Err(AudioError::Decode(format!("{}: no audio frames", file_name)));
        }

        tracing::debug!(
            file = file_name,
            channels,
            sample_rate,
            frames = samples.len() / channels as usize,
            "Decoded asset"
        );

        Ok(AudioBuffer::new(samples, channels, sample_rate))
    }
}
