use crate::error::WebrtcError;
use crate::media::{AudioSource, EncodedAudioFrame};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

const MOCK_SOURCE_CAPACITY: usize = 32;

/// Audio source for tests: either yields a fixed sequence of frames or fails
/// acquisition outright.
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    frames: Vec<Bytes>,
    fail: bool,
}

impl MockAudioSource {
    pub fn with_frames(frames: Vec<Bytes>) -> Self {
        Self {
            frames,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            frames: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl AudioSource for MockAudioSource {
    async fn open(&self) -> Result<mpsc::Receiver<EncodedAudioFrame>, WebrtcError> {
        if self.fail {
            return Err(WebrtcError::MediaAcquisitionFailed(
                "capture device unavailable".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(MOCK_SOURCE_CAPACITY);
        let frames = self.frames.clone();
        tokio::spawn(async move {
            for frame in frames {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
