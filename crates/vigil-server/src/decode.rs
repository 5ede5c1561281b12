//! Inbound Track Decoding
//!
//! Turns the H.264 RTP stream of a remote video track into RGB frames for
//! the pipeline. RTP payloads are depacketized into Annex-B NAL units,
//! accumulated into access units on the marker bit, and decoded with
//! openh264. A corrupt access unit is skipped, never fatal.

use image::RgbImage;
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use tracing::{debug, warn};
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

use crate::error::ServiceError;

pub struct H264FrameDecoder {
    depacketizer: H264Packet,
    decoder: Decoder,
    access_unit: Vec<u8>,
}

impl H264FrameDecoder {
    pub fn new() -> Result<Self, ServiceError> {
        let decoder = Decoder::new().map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self {
            depacketizer: H264Packet::default(),
            decoder,
            access_unit: Vec::new(),
        })
    }

    /// Feed one RTP packet. Returns a decoded frame when the packet closes
    /// an access unit that decodes cleanly.
    pub fn push_packet(&mut self, packet: &Packet) -> Option<RgbImage> {
        match self.depacketizer.depacketize(&packet.payload) {
            Ok(nal) => {
                if !nal.is_empty() {
                    self.access_unit.extend_from_slice(&nal);
                }
            }
            Err(e) => {
                debug!(error = %e, "rtp depacketize failed, packet skipped");
                return None;
            }
        }

        // the marker bit closes the access unit
        if !packet.header.marker || self.access_unit.is_empty() {
            return None;
        }
        let access_unit = std::mem::take(&mut self.access_unit);

        match self.decoder.decode(&access_unit) {
            Ok(Some(yuv)) => yuv_to_rgb(&yuv),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "h264 decode failed, access unit dropped");
                None
            }
        }
    }
}

fn yuv_to_rgb(yuv: &openh264::decoder::DecodedYUV) -> Option<RgbImage> {
    let (width, height) = yuv.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let mut rgb = vec![0u8; width * height * 3];
    yuv.write_rgb8(&mut rgb);
    RgbImage::from_raw(width as u32, height as u32, rgb)
}
