//! Audio distribution
//!
//! Decoding runs off the event loop: the leader's file read and every decode
//! happen in a background task, and the result comes back as a
//! [`DecodedAsset`] on the loader's result channel. Only the newest request
//! counts; results of superseded requests are discarded by generation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::buffer::AudioAsset;
use crate::audio::engine::AssetDecoder;
use crate::error::{AudioError, Error, Result};

/// Where an asset came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOrigin {
    /// Loaded from disk by this node; must be distributed once decoded
    Local,
    /// Received in an `audio` message from `from`
    Remote { from: String },
}

/// Outcome of one decode request
#[derive(Debug)]
pub struct DecodedAsset {
    pub generation: u64,
    pub origin: AssetOrigin,
    pub file_name: String,
    /// Encoded bytes, kept for local loads so they can be sent on
    pub raw_bytes: Option<Vec<u8>>,
    pub result: Result<AudioAsset>,
}

/// Runs asset reads and decodes in the background
pub struct AssetLoader {
    decoder: Arc<dyn AssetDecoder>,
    results: mpsc::UnboundedSender<DecodedAsset>,
    generation: u64,
    in_flight: Option<JoinHandle<()>>,
}

impl AssetLoader {
    pub fn new(decoder: Arc<dyn AssetDecoder>, results: mpsc::UnboundedSender<DecodedAsset>) -> Self {
        Self {
            decoder,
            results,
            generation: 0,
            in_flight: None,
        }
    }

    /// Read and decode a local file. Returns the request generation.
    pub fn load_local(&mut self, path: PathBuf) -> u64 {
        let generation = self.supersede();
        let decoder = self.decoder.clone();
        let results = self.results.clone();
        let file_name = file_name_of(&path);

        tracing::info!("Loading {}", path.display());

        self.in_flight = Some(tokio::spawn(async move {
            let decoded = match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let (bytes, result) = decode_blocking(decoder, file_name.clone(), bytes).await;
                    DecodedAsset {
                        generation,
                        origin: AssetOrigin::Local,
                        file_name,
                        raw_bytes: Some(bytes),
                        result,
                    }
                }
                Err(e) => DecodedAsset {
                    generation,
                    origin: AssetOrigin::Local,
                    file_name,
                    raw_bytes: None,
                    result: Err(e.into()),
                },
            };
            let _ = results.send(decoded);
        }));

        generation
    }

    /// Decode bytes received from `from`. Returns the request generation.
    pub fn accept_remote(&mut self, from: &str, file_name: String, raw_bytes: Vec<u8>) -> u64 {
        let generation = self.supersede();
        let decoder = self.decoder.clone();
        let results = self.results.clone();
        let origin = AssetOrigin::Remote {
            from: from.to_string(),
        };

        tracing::info!(peer = %from, "Received {} ({} bytes)", file_name, raw_bytes.len());

        self.in_flight = Some(tokio::spawn(async move {
            let (_, result) = decode_blocking(decoder, file_name.clone(), raw_bytes).await;
            let _ = results.send(DecodedAsset {
                generation,
                origin,
                file_name,
                raw_bytes: None,
                result,
            });
        }));

        generation
    }

    /// Drop any in-flight request
    pub fn cancel(&mut self) {
        self.supersede();
    }

    /// Whether `generation` is the newest request
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    fn supersede(&mut self) -> u64 {
        if let Some(task) = self.in_flight.take() {
            // A decode already on the blocking pool still finishes; its result is discarded
            task.abort();
        }
        self.generation += 1;
        self.generation
    }
}

impl Drop for AssetLoader {
    fn drop(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }
}

async fn decode_blocking(
    decoder: Arc<dyn AssetDecoder>,
    file_name: String,
    bytes: Vec<u8>,
) -> (Vec<u8>, Result<AudioAsset>) {
    let joined = tokio::task::spawn_blocking(move || {
        let result = decoder
            .decode(&file_name, &bytes)
            .map(|buffer| AudioAsset::new(file_name, bytes.len(), buffer));
        (bytes, result)
    })
    .await;

    match joined {
        Ok((bytes, result)) => (bytes, result.map_err(Error::from)),
        Err(e) => (
            Vec::new(),
            Err(AudioError::Decode(format!("decoder task failed: {}", e)).into()),
        ),
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::buffer::AudioBuffer;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Decodes any bytes into one second of silence per byte; rejects `b"bad"`
    pub(crate) struct FakeDecoder;

    impl AssetDecoder for FakeDecoder {
        fn decode(&self, file_name: &str, bytes: &[u8]) -> std::result::Result<AudioBuffer, AudioError> {
            if bytes == b"bad" {
                return Err(AudioError::Decode(format!("{}: not audio", file_name)));
            }
            Ok(AudioBuffer::silence(bytes.len() as f64, 1, 100))
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<DecodedAsset>) -> DecodedAsset {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for decode")
            .expect("result channel closed")
    }

    #[tokio::test]
    async fn test_local_load_keeps_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut loader = AssetLoader::new(Arc::new(FakeDecoder), tx);
        let generation = loader.load_local(path);

        let decoded = next(&mut rx).await;
        assert!(loader.is_current(decoded.generation));
        assert_eq!(decoded.generation, generation);
        assert_eq!(decoded.origin, AssetOrigin::Local);
        assert_eq!(decoded.file_name, "song.wav");
        assert_eq!(decoded.raw_bytes.as_deref(), Some(&[1u8, 2, 3][..]));

        let asset = decoded.result.unwrap();
        assert_eq!(asset.byte_size, 3);
        assert!((asset.duration_seconds - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut loader = AssetLoader::new(Arc::new(FakeDecoder), tx);
        loader.load_local(dir.path().join("absent.mp3"));

        let decoded = next(&mut rx).await;
        assert!(matches!(decoded.result, Err(Error::Io(_))));
        assert!(decoded.raw_bytes.is_none());
    }

    #[tokio::test]
    async fn test_remote_decode_failure_is_local() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut loader = AssetLoader::new(Arc::new(FakeDecoder), tx);
        loader.accept_remote("leader", "broken.mp3".into(), b"bad".to_vec());

        let decoded = next(&mut rx).await;
        assert_eq!(
            decoded.origin,
            AssetOrigin::Remote { from: "leader".into() }
        );
        assert!(matches!(decoded.result, Err(Error::Audio(AudioError::Decode(_)))));
    }

    #[tokio::test]
    async fn test_newer_request_supersedes() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut loader = AssetLoader::new(Arc::new(FakeDecoder), tx);
        let first = loader.accept_remote("leader", "a.wav".into(), vec![0; 4]);
        let second = loader.accept_remote("leader", "b.wav".into(), vec![0; 2]);

        assert!(!loader.is_current(first));
        assert!(loader.is_current(second));

        loader.cancel();
        assert!(!loader.is_current(second));
    }
}
