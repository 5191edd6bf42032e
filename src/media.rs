//! Local media tracks published by the `join` client.
//!
//! Capture devices are outside this crate; the tracks created here are the
//! sample sinks a capture backend writes into.

use std::sync::Arc;

use tracing::info;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::peer::LocalTrack;

pub const STREAM_ID: &str = "meshcall";

pub struct LocalMedia {
    pub audio: Option<Arc<TrackLocalStaticSample>>,
    pub video: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalMedia {
    /// Creates the tracks enabled in `config`. Having nothing to publish is
    /// a media error: the call is not started.
    pub fn open(config: &ClientConfig) -> Result<Self> {
        if !config.audio && !config.video {
            return Err(Error::Media(
                "neither audio nor video is enabled".to_string(),
            ));
        }

        let audio = config
            .audio
            .then(|| sample_track("audio", MIME_TYPE_OPUS));
        let video = config
            .video
            .then(|| sample_track("video", MIME_TYPE_VP8));
        info!(
            "Local media ready (audio: {}, video: {})",
            audio.is_some(),
            video.is_some()
        );
        Ok(Self { audio, video })
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        let mut tracks: Vec<LocalTrack> = Vec::new();
        if let Some(audio) = &self.audio {
            tracks.push(audio.clone());
        }
        if let Some(video) = &self.video {
            tracks.push(video.clone());
        }
        tracks
    }
}

fn sample_track(id: &str, mime_type: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        STREAM_ID.to_owned(),
    ))
}
