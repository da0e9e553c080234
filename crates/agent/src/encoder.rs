//! Real-time VP8 encoder.
//!
//! The pipeline is `appsrc (I420) → vp8enc → appsink`, tuned for
//! zero-lag streaming: realtime deadline, no lookahead, error resilience
//! on, and an automatic keyframe at most every `framerate` frames (one
//! per second). Colour conversion from RGBA happens in our code so the
//! BT.601 math is exact and the encoder always sees planar 4:2:0.

use std::sync::mpsc;
use std::time::Duration;

use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use tracing::{debug, info};

use crate::error::{AgentError, Result};

/// The fixed resolution the encoder consumes and operator coordinates
/// refer to.
pub const ENCODE_WIDTH: u32 = 1920;
pub const ENCODE_HEIGHT: u32 = 1080;

/// How long `encode` waits for the first packet of a frame before
/// reporting an empty output. The encoder runs with a realtime deadline,
/// so packets normally arrive well inside this window.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(5);

pub struct Encoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    encoded_rx: mpsc::Receiver<Vec<u8>>,
    width: u32,
    height: u32,
    frame_duration: ClockTime,
}

impl Encoder {
    pub fn new(width: u32, height: u32, framerate: u32, bitrate_kbps: u32) -> Result<Self> {
        let pipeline = gst::Pipeline::new();

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(framerate as i32, 1))
            .build();

        let appsrc_elem = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .map_err(|e| AgentError::Codec(format!("create appsrc: {e}")))?;
        let appsrc = appsrc_elem
            .dynamic_cast::<AppSrc>()
            .map_err(|_| AgentError::Codec("cast to AppSrc".into()))?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        // block=false: a stalled encoder must never wedge the pump.
        appsrc.set_property("block", false);

        // Realtime tuning: deadline=1 selects libvpx realtime mode,
        // lag-in-frames=0 disables lookahead, keyframe-max-dist gives one
        // keyframe per second for fast recovery after loss.
        let vp8enc = ElementFactory::make("vp8enc")
            .property("deadline", 1i64)
            .property("lag-in-frames", 0i32)
            .property("keyframe-max-dist", framerate as i32)
            .property("target-bitrate", (bitrate_kbps * 1000) as i32)
            .property("cpu-used", 4i32)
            .property_from_str("error-resilient", "default")
            .property_from_str("end-usage", "cbr")
            .build()
            .map_err(|e| AgentError::Codec(format!("create vp8enc: {e}")))?;

        let appsink_elem = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", true)
            .build()
            .map_err(|e| AgentError::Codec(format!("create appsink: {e}")))?;
        let appsink = appsink_elem
            .dynamic_cast::<AppSink>()
            .map_err(|_| AgentError::Codec("cast to AppSink".into()))?;

        let (encoded_tx, encoded_rx) = mpsc::channel::<Vec<u8>>();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let _ = encoded_tx.send(map.to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .add_many([appsrc.upcast_ref(), &vp8enc, appsink.upcast_ref()])
            .map_err(|e| AgentError::Codec(format!("assemble pipeline: {e}")))?;
        gst::Element::link_many([appsrc.upcast_ref(), &vp8enc, appsink.upcast_ref()])
            .map_err(|e| AgentError::Codec(format!("link pipeline: {e}")))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| AgentError::Codec(format!("start pipeline: {e}")))?;

        info!(width, height, framerate, bitrate_kbps, "VP8 encoder pipeline started");

        Ok(Self {
            pipeline,
            appsrc,
            encoded_rx,
            width,
            height,
            frame_duration: ClockTime::from_nseconds(1_000_000_000 / framerate as u64),
        })
    }

    /// Encode one RGBA frame at the fixed encode resolution. Returns the
    /// concatenation of every packet the codec produced for this input —
    /// possibly empty, which the caller handles by skipping the track
    /// write.
    pub fn encode(&mut self, rgba: &[u8], frame_index: u64) -> Result<Vec<u8>> {
        validate_frame_len(rgba.len(), self.width, self.height)?;
        self.check_bus()?;

        let i420 = rgba_to_i420(rgba, self.width, self.height);
        let mut buffer = gst::Buffer::from_mut_slice(i420);
        {
            let buffer = buffer.get_mut().expect("fresh buffer is uniquely owned");
            buffer.set_pts(ClockTime::from_nseconds(
                self.frame_duration.nseconds() * frame_index,
            ));
            buffer.set_duration(self.frame_duration);
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| AgentError::Codec(format!("push frame: {e}")))?;

        let mut out = Vec::new();
        match self.encoded_rx.recv_timeout(DRAIN_TIMEOUT) {
            Ok(packet) => out.extend_from_slice(&packet),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // Codec batched internally; the packet will come out with
                // a later frame.
                debug!(frame_index, "No packet produced for this input");
                return Ok(out);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(AgentError::Codec("encoder pipeline disconnected".into()));
            }
        }
        while let Ok(packet) = self.encoded_rx.try_recv() {
            out.extend_from_slice(&packet);
        }
        Ok(out)
    }

    /// Ask the codec to emit a keyframe on the next frame. Called when a
    /// peer reaches connected so the operator's decoder can start
    /// immediately instead of waiting out the keyframe interval.
    pub fn force_keyframe(&self) {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        self.appsrc.send_event(event);
        debug!("Requested VP8 keyframe");
    }

    /// Surface any pipeline error posted on the bus. Codec errors are
    /// fatal for the session.
    fn check_bus(&self) -> Result<()> {
        if let Some(bus) = self.pipeline.bus() {
            while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
                if let gst::MessageView::Error(err) = msg.view() {
                    return Err(AgentError::Codec(format!(
                        "pipeline error from {:?}: {}",
                        err.src().map(|s| s.name().to_string()),
                        err.error()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
        debug!("Encoder pipeline shut down");
    }
}

/// Convert packed RGBA to planar I420 (4:2:0), ITU-R BT.601 studio range.
///
/// Luma is computed for every pixel; chroma is sampled from the top-left
/// pixel of each 2×2 block. The rounding is the reference form
/// `((coeff · rgb + 128) >> 8) + offset`, clamped to `[0, 255]`.
pub fn rgba_to_i420(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let chroma_w = w / 2;
    let chroma_h = h / 2;
    let mut out = vec![0u8; w * h + 2 * chroma_w * chroma_h];
    let (y_plane, uv) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = uv.split_at_mut(chroma_w * chroma_h);

    for row in 0..h {
        for col in 0..w {
            let i = (row * w + col) * 4;
            let r = rgba[i] as i32;
            let g = rgba[i + 1] as i32;
            let b = rgba[i + 2] as i32;
            y_plane[row * w + col] = clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16);
        }
    }

    for row in 0..chroma_h {
        for col in 0..chroma_w {
            let i = (row * 2 * w + col * 2) * 4;
            let r = rgba[i] as i32;
            let g = rgba[i + 1] as i32;
            let b = rgba[i + 2] as i32;
            u_plane[row * chroma_w + col] = clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128);
            v_plane[row * chroma_w + col] = clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128);
        }
    }

    out
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// A frame handed to `encode` must be exactly `width × height × 4` bytes;
/// anything else is a caller bug, reported rather than truncated.
fn validate_frame_len(len: usize, width: u32, height: u32) -> Result<()> {
    let expected = (width * height * 4) as usize;
    if len != expected {
        return Err(AgentError::Codec(format!(
            "frame size mismatch: got {len} bytes, expected {expected}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_rgba(width: u32, height: u32, r: u8, g: u8, b: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&[r, g, b, 255]);
        }
        data
    }

    fn planes(i420: &[u8], width: usize, height: usize) -> (&[u8], &[u8], &[u8]) {
        let y_len = width * height;
        let c_len = (width / 2) * (height / 2);
        (
            &i420[..y_len],
            &i420[y_len..y_len + c_len],
            &i420[y_len + c_len..],
        )
    }

    #[test]
    fn i420_plane_sizes() {
        let out = rgba_to_i420(&solid_rgba(16, 8, 0, 0, 0), 16, 8);
        assert_eq!(out.len(), 16 * 8 + 2 * 8 * 4);
    }

    #[test]
    fn black_maps_to_studio_floor() {
        let out = rgba_to_i420(&solid_rgba(4, 4, 0, 0, 0), 4, 4);
        let (y, u, v) = planes(&out, 4, 4);
        assert!(y.iter().all(|&p| p == 16));
        assert!(u.iter().all(|&p| p == 128));
        assert!(v.iter().all(|&p| p == 128));
    }

    #[test]
    fn white_maps_to_studio_ceiling() {
        let out = rgba_to_i420(&solid_rgba(4, 4, 255, 255, 255), 4, 4);
        let (y, u, v) = planes(&out, 4, 4);
        assert!(y.iter().all(|&p| p == 235));
        assert!(u.iter().all(|&p| p == 128));
        assert!(v.iter().all(|&p| p == 128));
    }

    #[test]
    fn pure_red_reference_values() {
        let out = rgba_to_i420(&solid_rgba(4, 4, 255, 0, 0), 4, 4);
        let (y, u, v) = planes(&out, 4, 4);
        assert!(y.iter().all(|&p| p == 82));
        assert!(u.iter().all(|&p| p == 90));
        assert!(v.iter().all(|&p| p == 240));
    }

    #[test]
    fn pure_green_reference_values() {
        let out = rgba_to_i420(&solid_rgba(4, 4, 0, 255, 0), 4, 4);
        let (y, u, v) = planes(&out, 4, 4);
        assert!(y.iter().all(|&p| p == 144));
        assert!(u.iter().all(|&p| p == 54));
        assert!(v.iter().all(|&p| p == 34));
    }

    #[test]
    fn chroma_sampled_from_top_left_of_block() {
        // 2×2 image: top-left red, everything else black. Chroma must be
        // red's, luma must differ per pixel.
        let mut rgba = solid_rgba(2, 2, 0, 0, 0);
        rgba[0] = 255;
        let out = rgba_to_i420(&rgba, 2, 2);
        let (y, u, v) = planes(&out, 2, 2);
        assert_eq!(y[0], 82);
        assert_eq!(y[1], 16);
        assert_eq!(u, &[90]);
        assert_eq!(v, &[240]);
    }

    #[test]
    fn clamp_bounds() {
        assert_eq!(clamp_u8(-5), 0);
        assert_eq!(clamp_u8(0), 0);
        assert_eq!(clamp_u8(255), 255);
        assert_eq!(clamp_u8(300), 255);
    }

    #[test]
    fn frame_length_law() {
        assert!(validate_frame_len((1920 * 1080 * 4) as usize, 1920, 1080).is_ok());
        assert!(matches!(
            validate_frame_len((1920 * 1080 * 4 - 1) as usize, 1920, 1080),
            Err(AgentError::Codec(_))
        ));
        assert!(matches!(
            validate_frame_len(0, 1920, 1080),
            Err(AgentError::Codec(_))
        ));
    }
}
