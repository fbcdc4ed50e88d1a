//! Audio file loading and decoding

use segue_audio::{LoadError, PcmBuffer, Track, TrackAudio, TrackSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;

/// Track metadata
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub duration_secs: f64,
    /// Rate of the file before resampling
    pub source_sample_rate: u32,
    /// Channels in the file; decoded audio is always stereo
    pub channels: u16,
}

/// A decoded track at the engine sample rate
pub struct DecodedTrack {
    /// Interleaved stereo samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub metadata: TrackMetadata,
}

impl DecodedTrack {
    pub fn into_pcm(self) -> PcmBuffer {
        PcmBuffer::new(Arc::new(self.samples), self.sample_rate)
    }
}

/// Audio file loader using Symphonia
pub struct TrackLoader {
    target_sample_rate: u32,
}

impl Default for TrackLoader {
    fn default() -> Self {
        Self::with_sample_rate(48000)
    }
}

impl TrackLoader {
    /// Create a loader that resamples to `target_sample_rate`
    pub fn with_sample_rate(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Decode an audio file into stereo at the target rate
    pub fn load(&self, path: &Path) -> Result<DecodedTrack, LoadError> {
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| LoadError::Decode(e.to_string()))?;

        let mut format = probed.format;

        // First audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(LoadError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let source_sample_rate = codec_params.sample_rate.unwrap_or(44100);
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(2)
            .max(1);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| LoadError::Decode(e.to_string()))?;

        let mut metadata = extract_metadata(&mut format, path);
        metadata.source_sample_rate = source_sample_rate;
        metadata.channels = channels;

        let mut samples: Vec<f32> = Vec::new();
        let mut skipped = 0usize;

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "stopping decode");
                    break;
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };

            let spec = *decoded.spec();
            let duration = decoded.capacity() as u64;

            let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
            sample_buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(sample_buf.samples());
        }
        if skipped > 0 {
            tracing::warn!(path = %path.display(), skipped, "skipped undecodable packets");
        }
        if samples.is_empty() {
            return Err(LoadError::Decode("file contains no audio".into()));
        }

        let total_frames = samples.len() / channels as usize;
        metadata.duration_secs = total_frames as f64 / source_sample_rate as f64;

        let samples = if source_sample_rate != self.target_sample_rate {
            self.resample(&samples, source_sample_rate, channels)?
        } else {
            samples
        };

        tracing::info!(
            path = %path.display(),
            title = %metadata.title,
            duration = metadata.duration_secs,
            source_rate = source_sample_rate,
            channels,
            "decoded track"
        );

        Ok(DecodedTrack {
            samples: to_stereo(samples, channels),
            sample_rate: self.target_sample_rate,
            metadata,
        })
    }

    /// Resample audio to target sample rate
    fn resample(
        &self,
        samples: &[f32],
        source_rate: u32,
        channels: u16,
    ) -> Result<Vec<f32>, LoadError> {
        use rubato::{FftFixedInOut, Resampler};

        let channels_usize = channels as usize;
        let frames = samples.len() / channels_usize;

        let mut resampler = FftFixedInOut::<f32>::new(
            source_rate as usize,
            self.target_sample_rate as usize,
            1024,
            channels_usize,
        )
        .map_err(|e| LoadError::Decode(e.to_string()))?;

        // Deinterleave
        let deinterleaved: Vec<Vec<f32>> = (0..channels_usize)
            .map(|ch| {
                (0..frames)
                    .map(|f| samples[f * channels_usize + ch])
                    .collect()
            })
            .collect();

        let chunk_size = resampler.input_frames_next();
        let mut output: Vec<Vec<f32>> = vec![Vec::new(); channels_usize];

        let mut pos = 0;
        while pos + chunk_size <= frames {
            let input_refs: Vec<&[f32]> = deinterleaved
                .iter()
                .map(|ch| &ch[pos..pos + chunk_size])
                .collect();

            let resampled = resampler
                .process(&input_refs, None)
                .map_err(|e| LoadError::Decode(e.to_string()))?;

            for (ch, data) in resampled.into_iter().enumerate() {
                output[ch].extend(data);
            }

            pos += chunk_size;
        }

        // Zero-pad the last partial chunk and keep the proportional output
        if pos < frames {
            let remaining = frames - pos;
            let padded: Vec<Vec<f32>> = deinterleaved
                .iter()
                .map(|ch| {
                    let mut v = ch[pos..].to_vec();
                    v.resize(chunk_size, 0.0);
                    v
                })
                .collect();

            let input_refs: Vec<&[f32]> = padded.iter().map(|v| v.as_slice()).collect();
            let resampled = resampler
                .process(&input_refs, None)
                .map_err(|e| LoadError::Decode(e.to_string()))?;
            let output_frames =
                (remaining * self.target_sample_rate as usize) / source_rate as usize;
            for (ch, data) in resampled.into_iter().enumerate() {
                output[ch].extend(&data[..output_frames.min(data.len())]);
            }
        }

        // Reinterleave
        let output_frames = output.first().map_or(0, Vec::len);
        let mut interleaved = Vec::with_capacity(output_frames * channels_usize);
        for frame_idx in 0..output_frames {
            for channel in &output {
                interleaved.push(channel[frame_idx]);
            }
        }

        Ok(interleaved)
    }
}

/// Mono is duplicated, extra channels beyond the first two are dropped
fn to_stereo(samples: Vec<f32>, channels: u16) -> Vec<f32> {
    match channels {
        2 => samples,
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        n => samples
            .chunks_exact(n as usize)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

fn extract_metadata(format: &mut Box<dyn FormatReader>, path: &Path) -> TrackMetadata {
    let mut metadata = TrackMetadata {
        title: path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Unknown")
            .to_string(),
        artist: "Unknown".to_string(),
        ..Default::default()
    };

    if let Some(meta) = format.metadata().current() {
        for tag in meta.tags() {
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) => metadata.title = tag.value.to_string(),
                Some(StandardTagKey::Artist) => metadata.artist = tag.value.to_string(),
                _ => {}
            }
        }
    }

    metadata
}

/// Opens tracks from the filesystem. `source_ref` is a path, resolved
/// against `root` when relative.
pub struct FileTrackSource {
    loader: TrackLoader,
    root: Option<PathBuf>,
}

impl FileTrackSource {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            loader: TrackLoader::with_sample_rate(sample_rate),
            root: None,
        }
    }

    /// Resolve relative source refs against `root`
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn loader(&self) -> &TrackLoader {
        &self.loader
    }

    pub fn resolve(&self, source_ref: &str) -> PathBuf {
        let path = PathBuf::from(source_ref);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

impl TrackSource for FileTrackSource {
    fn open(&self, track: &Track) -> Result<TrackAudio, LoadError> {
        let path = self.resolve(&track.source_ref);
        if !path.is_file() {
            tracing::warn!(path = %path.display(), "track source unreachable");
            return Err(LoadError::Unreachable(path.display().to_string()));
        }
        let decoded = self.loader.load(&path)?;
        Ok(TrackAudio::Buffer(decoded.into_pcm()))
    }
}
