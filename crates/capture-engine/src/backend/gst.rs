//! GStreamer capture pipelines ending in an `appsink`.
//!
//! The pipeline does the platform capture and any encoding; the backend
//! pulls finished buffers without blocking. Buffer timestamps are pipeline
//! running time, which is also what `native_clock_ns` reads. `start`,
//! `end_stream` and `stop` wait on the pipeline and are only called from
//! the blocking pool.

use std::sync::OnceLock;
use std::time::Duration;

use gst::prelude::*;
use gstreamer as gst;
use syncap_common::config::{AudioConfig, ScreenConfig, VideoCodec};
use syncap_common::error::{RecorderError, RecorderResult};
use syncap_sample_model::{AudioBlock, Captured, VideoFrame};

use super::blocks::BlockAssembler;
use super::{AudioSource, FrameSource};

const EOS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A launched pipeline with an appsink named `sink`.
struct AppSinkPipeline {
    name: String,
    pipeline: gst::Pipeline,
    sink: gst::Element,
    running: bool,
    /// EOS was sent and acknowledged (or timed out).
    ended: bool,
}

impl AppSinkPipeline {
    fn from_launch(name: impl Into<String>, launch: &str) -> RecorderResult<Self> {
        init_gstreamer()?;
        let name = name.into();

        let element = gst::parse::launch(launch)
            .map_err(|e| RecorderError::capture(format!("Failed to build {name} pipeline: {e}")))?;
        let pipeline = element.dynamic_cast::<gst::Pipeline>().map_err(|_| {
            RecorderError::capture(format!("{name}: launch string did not produce a pipeline"))
        })?;
        let sink = pipeline
            .by_name("sink")
            .ok_or_else(|| RecorderError::capture(format!("{name}: pipeline has no appsink")))?;

        tracing::debug!(pipeline = %name, launch, "Built capture pipeline");
        Ok(Self {
            name,
            pipeline,
            sink,
            running: false,
            ended: false,
        })
    }

    fn start(&mut self) -> RecorderResult<()> {
        self.pipeline.set_state(gst::State::Playing).map_err(|e| {
            RecorderError::capture(format!("Failed to start {} pipeline: {e:?}", self.name))
        })?;

        // State changes are asynchronous; wait so the capture device is open
        // before calibration reads the pipeline clock.
        match self.pipeline.state(gst::ClockTime::from_seconds(10)) {
            (Ok(_), gst::State::Playing, _) => {}
            (Ok(_), state, _) => {
                tracing::warn!(
                    pipeline = %self.name,
                    ?state,
                    "Pipeline did not reach Playing state within timeout"
                );
            }
            (Err(e), _, _) => {
                return Err(RecorderError::capture(format!(
                    "{} pipeline failed to reach Playing state: {e:?}",
                    self.name
                )));
            }
        }
        self.running = true;
        Ok(())
    }

    fn running_time_ns(&self) -> RecorderResult<u64> {
        self.pipeline
            .current_running_time()
            .map(|t| t.nseconds())
            .ok_or_else(|| RecorderError::capture(format!("{}: pipeline clock not running", self.name)))
    }

    /// Next buffered sample, surfacing any pipeline error first.
    fn try_pull(&self) -> RecorderResult<Option<gst::Sample>> {
        if let Some(bus) = self.pipeline.bus() {
            if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
                if let gst::MessageView::Error(e) = msg.view() {
                    return Err(RecorderError::capture(format!(
                        "{} pipeline error: {}",
                        self.name,
                        e.error()
                    )));
                }
            }
        }
        Ok(self
            .sink
            .emit_by_name::<Option<gst::Sample>>("try-pull-sample", &[&0u64]))
    }

    fn is_eos(&self) -> bool {
        self.sink.property::<bool>("eos")
    }

    /// Send EOS so encoders flush and wait for it on the bus. Samples
    /// queued in the appsink stay pullable afterwards.
    fn end_stream(&mut self) -> RecorderResult<()> {
        if !self.running || self.ended {
            return Ok(());
        }
        self.ended = true;
        if !self.pipeline.send_event(gst::event::Eos::new()) {
            tracing::warn!(pipeline = %self.name, "Failed to send EOS event; tail may be lost");
            return Ok(());
        }
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        let timeout = gst::ClockTime::from_nseconds(EOS_DRAIN_TIMEOUT.as_nanos() as u64);
        let msg = bus.timed_pop_filtered(timeout, &[gst::MessageType::Eos, gst::MessageType::Error]);
        match msg.as_ref().map(|m| m.view()) {
            Some(gst::MessageView::Eos(_)) => {
                tracing::debug!(pipeline = %self.name, "EOS received; pipeline drained")
            }
            Some(gst::MessageView::Error(e)) => tracing::warn!(
                pipeline = %self.name,
                error = %e.error(),
                "Pipeline error during EOS drain"
            ),
            _ => tracing::warn!(
                pipeline = %self.name,
                timeout_s = EOS_DRAIN_TIMEOUT.as_secs(),
                "EOS drain timed out"
            ),
        }
        Ok(())
    }

    fn has_ended(&self) -> bool {
        self.ended || self.is_eos()
    }

    /// Tear the pipeline down, ending the stream first if nobody did.
    fn stop(&mut self) -> RecorderResult<()> {
        if !self.running {
            return Ok(());
        }
        self.end_stream()?;
        self.pipeline.set_state(gst::State::Null).map_err(|e| {
            RecorderError::capture(format!("Failed to stop {} pipeline: {e:?}", self.name))
        })?;
        self.running = false;
        Ok(())
    }
}

impl Drop for AppSinkPipeline {
    fn drop(&mut self) {
        if self.running {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

/// Screen capture through the platform's GStreamer screen source.
pub struct GstFrameSource {
    pipeline: AppSinkPipeline,
    codec: VideoCodec,
}

impl GstFrameSource {
    pub fn screen(config: &ScreenConfig) -> RecorderResult<Self> {
        let launch = screen_launch(config);
        Ok(Self {
            pipeline: AppSinkPipeline::from_launch("screen", &launch)?,
            codec: config.codec,
        })
    }
}

impl FrameSource for GstFrameSource {
    fn start(&mut self) -> RecorderResult<()> {
        self.pipeline.start()
    }

    fn next_frame(&mut self) -> RecorderResult<Option<Captured<VideoFrame>>> {
        let Some(sample) = self.pipeline.try_pull()? else {
            return Ok(None);
        };
        let buffer = sample
            .buffer()
            .ok_or_else(|| RecorderError::capture("screen sample without buffer"))?;
        let native_ns = match buffer.pts() {
            Some(pts) => pts.nseconds(),
            None => self.pipeline.running_time_ns()?,
        };
        let (width, height) = sample
            .caps()
            .and_then(|caps| caps.structure(0))
            .map(|s| {
                (
                    s.get::<i32>("width").unwrap_or(0).max(0) as u32,
                    s.get::<i32>("height").unwrap_or(0).max(0) as u32,
                )
            })
            .unwrap_or((0, 0));
        let map = buffer
            .map_readable()
            .map_err(|e| RecorderError::capture(format!("screen buffer not readable: {e}")))?;

        Ok(Some(Captured::new(
            native_ns,
            VideoFrame {
                width,
                height,
                codec: self.codec.as_str().to_string(),
                data: map.as_slice().to_vec(),
            },
        )))
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        self.pipeline.running_time_ns()
    }

    fn name(&self) -> &str {
        "gstreamer-screen"
    }

    fn is_exhausted(&self) -> bool {
        self.pipeline.is_eos()
    }

    fn end_stream(&mut self) -> RecorderResult<()> {
        self.pipeline.end_stream()
    }

    fn stop(&mut self) -> RecorderResult<()> {
        self.pipeline.stop()
    }
}

/// Audio capture, re-blocked into fixed `block_frames` blocks.
pub struct GstAudioSource {
    name: &'static str,
    pipeline: AppSinkPipeline,
    blocks: BlockAssembler,
}

impl GstAudioSource {
    pub fn capture(config: &AudioConfig) -> RecorderResult<Self> {
        let (name, label) = if config.loopback {
            ("gstreamer-audio", "audio")
        } else {
            ("gstreamer-mic", "microphone")
        };
        let launch = audio_launch(config);
        Ok(Self {
            name,
            pipeline: AppSinkPipeline::from_launch(label, &launch)?,
            blocks: BlockAssembler::new(config.sample_rate, config.channels, config.block_frames),
        })
    }
}

impl AudioSource for GstAudioSource {
    fn start(&mut self) -> RecorderResult<()> {
        self.pipeline.start()
    }

    fn next_block(&mut self) -> RecorderResult<Option<Captured<AudioBlock>>> {
        loop {
            if let Some(block) = self.blocks.pop() {
                return Ok(Some(block));
            }
            let Some(sample) = self.pipeline.try_pull()? else {
                if self.pipeline.has_ended() && !self.blocks.is_empty() {
                    self.blocks.flush_partial();
                    continue;
                }
                return Ok(None);
            };
            let Some(buffer) = sample.buffer() else {
                continue;
            };
            let pts = match buffer.pts() {
                Some(pts) => pts.nseconds(),
                None => self.pipeline.running_time_ns()?,
            };
            let map = buffer
                .map_readable()
                .map_err(|e| RecorderError::capture(format!("audio buffer not readable: {e}")))?;
            self.blocks.push(pts, map.as_slice());
        }
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        self.pipeline.running_time_ns()
    }

    fn name(&self) -> &str {
        self.name
    }

    fn is_exhausted(&self) -> bool {
        self.blocks.is_empty() && self.pipeline.is_eos()
    }

    fn end_stream(&mut self) -> RecorderResult<()> {
        self.pipeline.end_stream()
    }

    fn stop(&mut self) -> RecorderResult<()> {
        self.pipeline.stop()
    }
}

fn screen_launch(config: &ScreenConfig) -> String {
    let show = if config.show_cursor { "true" } else { "false" };
    #[cfg(target_os = "windows")]
    let source = format!(
        "d3d11screencapturesrc monitor-index={} show-cursor={show}",
        config.monitor_index
    );
    #[cfg(target_os = "macos")]
    let source = format!(
        "avfvideosrc capture-screen=true capture-screen-cursor={show} device-index={}",
        config.monitor_index
    );
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    let source = format!("ximagesrc use-damage=false remote=true show-pointer={show}");

    let mut raw_caps = String::from("video/x-raw,format=BGRx");
    if let Some(width) = config.width {
        raw_caps.push_str(&format!(",width={width}"));
    }
    if let Some(height) = config.height {
        raw_caps.push_str(&format!(",height={height}"));
    }
    let framerate = format!("1000000/{}", config.frame_interval_us.max(1));
    let encode = match config.codec {
        VideoCodec::RawBgrx => String::new(),
        VideoCodec::H264 => {
            " ! x264enc tune=zerolatency speed-preset=veryfast ! h264parse config-interval=-1 ! video/x-h264,stream-format=byte-stream,alignment=au".to_string()
        }
    };

    // The leaky queue sheds frames at the source when the encoder falls
    // behind; the appsink never drops.
    format!(
        "{source} ! queue max-size-buffers=200 leaky=downstream ! videoconvert ! videoscale ! {raw_caps} ! videorate ! video/x-raw,framerate={framerate}{encode} ! appsink name=sink sync=false max-buffers=0 drop=false"
    )
}

fn audio_launch(config: &AudioConfig) -> String {
    #[cfg(target_os = "windows")]
    let source = format!(
        "wasapisrc low-latency=true do-timestamp=true loopback={}",
        config.loopback
    );
    #[cfg(target_os = "macos")]
    let source = "osxaudiosrc do-timestamp=true".to_string();
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    let source = if config.loopback {
        "pulsesrc do-timestamp=true device=@DEFAULT_MONITOR@".to_string()
    } else {
        "pulsesrc do-timestamp=true".to_string()
    };

    format!(
        "{source} ! audioconvert ! audioresample ! audio/x-raw,format=S16LE,layout=interleaved,rate={},channels={} ! appsink name=sink sync=false max-buffers=0 drop=false",
        config.sample_rate, config.channels
    )
}

fn init_gstreamer() -> RecorderResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    match GST_INIT.get_or_init(|| gst::init().map_err(|e| e.to_string())) {
        Ok(()) => Ok(()),
        Err(e) => Err(RecorderError::capture(format!(
            "Failed to initialize GStreamer: {e}"
        ))),
    }
}
