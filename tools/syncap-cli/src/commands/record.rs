//! Start a recording session and run it until interrupted.

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use syncap_capture_engine::{
    SessionController, SessionReport, SessionStatus, ShutdownHandle, ShutdownReason,
};
use syncap_common::config::{BackendChoice, RecorderConfig};

/// Which implementation every enabled source uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// Platform capture
    Native,
    /// Generated test content
    Synthetic,
}

impl From<BackendArg> for BackendChoice {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Native => BackendChoice::Native,
            BackendArg::Synthetic => BackendChoice::Synthetic,
        }
    }
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Output stem: writes <OUTPUT>.media, <OUTPUT>.events.jsonl and
    /// <OUTPUT>.session.json
    pub output: PathBuf,

    /// Backend for every source
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Disable screen capture
    #[arg(long)]
    pub no_screen: bool,

    /// Disable audio capture
    #[arg(long)]
    pub no_audio: bool,

    /// Also record the microphone as a separate audio track
    #[arg(long)]
    pub record_mic: bool,

    /// Disable keyboard/mouse capture
    #[arg(long)]
    pub no_input: bool,

    /// Disable window focus/geometry capture
    #[arg(long)]
    pub no_window: bool,

    /// Interval between screen frames in microseconds
    #[arg(long)]
    pub frame_interval_us: Option<u64>,

    /// Audio frames per block
    #[arg(long)]
    pub block_frames: Option<u32>,

    /// Upper bound on draining after a stop, in milliseconds
    #[arg(long)]
    pub drain_timeout_ms: Option<u64>,

    /// Count down this many milliseconds before the sources start
    #[arg(long)]
    pub start_after_ms: Option<u64>,

    /// Stop on its own after this many milliseconds
    #[arg(long)]
    pub stop_after_ms: Option<u64>,

    /// Replace artifacts of a previous recording with the same stem
    #[arg(long)]
    pub overwrite: bool,

    /// Where to announce the recorder's pid
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}

impl RecordArgs {
    /// Layer the flags over the loaded config.
    pub fn apply(&self, config: &mut RecorderConfig) {
        config.output.path = self.output.clone();
        config.output.overwrite |= self.overwrite;

        let sources = &mut config.sources;
        if let Some(backend) = self.backend {
            let choice = BackendChoice::from(backend);
            sources.screen.backend = choice;
            sources.audio.backend = choice;
            sources.microphone.backend = choice;
            sources.input.backend = choice;
            sources.window.backend = choice;
        }
        sources.screen.enabled &= !self.no_screen;
        sources.audio.enabled &= !self.no_audio;
        sources.microphone.enabled |= self.record_mic;
        sources.input.enabled &= !self.no_input;
        sources.window.enabled &= !self.no_window;

        if let Some(us) = self.frame_interval_us {
            sources.screen.frame_interval_us = us;
        }
        if let Some(frames) = self.block_frames {
            sources.audio.block_frames = frames;
        }
        if let Some(ms) = self.drain_timeout_ms {
            config.session.drain_timeout_ms = ms;
        }
        if self.start_after_ms.is_some() {
            config.session.start_after_ms = self.start_after_ms;
        }
        if self.stop_after_ms.is_some() {
            config.session.stop_after_ms = self.stop_after_ms;
        }
        if let Some(path) = &self.pid_file {
            config.session.pid_file = Some(path.clone());
        }
    }
}

pub async fn run(mut config: RecorderConfig, args: RecordArgs) -> anyhow::Result<()> {
    args.apply(&mut config);
    config.validate()?;

    let s = &config.sources;
    println!("Starting recording: {}", config.output.path.display());
    println!("  Screen: {}", describe(s.screen.enabled, s.screen.backend));
    println!("  Audio: {}", describe(s.audio.enabled, s.audio.backend));
    println!("  Microphone: {}", describe(s.microphone.enabled, s.microphone.backend));
    println!("  Input: {}", describe(s.input.enabled, s.input.backend));
    println!("  Window: {}", describe(s.window.enabled, s.window.backend));
    println!("  Pid file: {}", config.session.pid_file_path().display());
    println!();

    if let Some(delay) = config.session.start_after() {
        println!("Starting in {:.1}s...", delay.as_secs_f64());
    }

    let mut session = SessionController::new(config);
    let signals = tokio::spawn(forward_interrupts(session.shutdown_handle()));

    if let Err(e) = session.start().await {
        signals.abort();
        return Err(e.into());
    }
    println!("Recording. Press Ctrl+C or run `syncap stop` to finish...");

    let report = session.wait().await;
    signals.abort();
    let report = report?;

    println!();
    print_report(&report);

    if report.status == SessionStatus::Failed {
        anyhow::bail!(
            "Recording failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Turn every process interrupt into a shutdown request.
async fn forward_interrupts(handle: ShutdownHandle) {
    loop {
        if let Err(e) = interrupted().await {
            tracing::warn!(error = %e, "Cannot listen for interrupts");
            return;
        }
        println!();
        println!("Interrupt received; draining...");
        handle.request(ShutdownReason::Signal);
        if handle.is_closed() {
            return;
        }
    }
}

#[cfg(unix)]
async fn interrupted() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn interrupted() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn describe(enabled: bool, backend: BackendChoice) -> String {
    if enabled {
        format!("{backend:?}").to_lowercase()
    } else {
        "off".to_string()
    }
}

fn print_report(report: &SessionReport) {
    let outcome = match (report.status, report.close_status) {
        (SessionStatus::Closed, Some(status)) => format!("{status:?}").to_lowercase(),
        (status, _) => format!("{status:?}").to_lowercase(),
    };
    println!("Session {} ({outcome})", report.session_id);
    println!("  Samples written: {}", report.samples_written);
    if report.discarded > 0 {
        println!("  Discarded at drain deadline: {}", report.discarded);
    }
    for source in &report.sources {
        print!(
            "  {:<12} {:<16} {:?}: {} samples, {} missing",
            source.kind.as_str(),
            source.backend,
            source.final_health,
            source.samples,
            source.missing
        );
        if source.clock_corrections > 0 {
            print!(", {} clock corrections", source.clock_corrections);
        }
        println!();
        if let Some(error) = &source.error {
            println!("               {error}");
        }
    }
    println!("  Media:    {}", report.paths.media.display());
    println!("  Events:   {}", report.paths.events.display());
    println!("  Manifest: {}", report.paths.manifest.display());
}
