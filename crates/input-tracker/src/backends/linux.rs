//! Linux backends: evdev keyboards and pointers (falling back to
//! `/dev/input/mice`) for input, and X11 property polling for the focused
//! window.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::Command;

use evdev::{InputEventKind, Key, RelativeAxisType, Synchronization};
use syncap_common::error::{RecorderError, RecorderResult};
use syncap_sample_model::{
    ButtonState, Captured, InputEvent, KeyboardRepeat, MouseButton, PointerBallistics,
    SessionEnvironment, WindowEvent,
};

use crate::scripted::ScriptedInputBackend;
use crate::{BackendClock, InputBackend, WindowBackend};

const MICE_DEVICE: &str = "/dev/input/mice";

const LEFT_BUTTON: usize = 0;
const RIGHT_BUTTON: usize = 1;
const MIDDLE_BUTTON: usize = 2;

/// Normalized pointer position, integrated from relative motion.
#[derive(Debug, Clone, Copy)]
struct Pointer {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

impl Pointer {
    fn centered((width, height): (f64, f64)) -> Self {
        Self {
            x: 0.5,
            y: 0.5,
            width: width.max(1.0),
            height: height.max(1.0),
        }
    }

    fn shift(&mut self, dx: f64, dy: f64) {
        self.x = (self.x + dx / self.width).clamp(0.0, 1.0);
        self.y = (self.y + dy / self.height).clamp(0.0, 1.0);
    }
}

/// Turns raw evdev events into input events. Motion is accumulated until
/// the device's `SYN_REPORT` so one report yields one pointer update.
#[derive(Debug)]
struct EventTranslator {
    pointer: Pointer,
    moved: bool,
}

impl EventTranslator {
    fn new(pointer: Pointer) -> Self {
        Self {
            pointer,
            moved: false,
        }
    }

    fn translate(&mut self, event: &evdev::InputEvent) -> Option<InputEvent> {
        let state = match event.value() {
            0 => ButtonState::Up,
            1 => ButtonState::Down,
            // Autorepeat and anything else.
            _ => ButtonState::Down,
        };
        let (x, y) = (self.pointer.x, self.pointer.y);

        match event.kind() {
            InputEventKind::Key(key) => {
                if event.value() > 1 {
                    return None;
                }
                match mouse_button(key) {
                    Some(button) => Some(InputEvent::click(button, state, x, y)),
                    None => Some(InputEvent::key(format!("{key:?}"), state)),
                }
            }
            InputEventKind::RelAxis(axis) => {
                let delta = event.value() as f64;
                match axis {
                    RelativeAxisType::REL_X => {
                        self.pointer.shift(delta, 0.0);
                        self.moved = true;
                        None
                    }
                    RelativeAxisType::REL_Y => {
                        self.pointer.shift(0.0, delta);
                        self.moved = true;
                        None
                    }
                    RelativeAxisType::REL_WHEEL => Some(InputEvent::Scroll {
                        dx: 0.0,
                        dy: delta,
                        x,
                        y,
                    }),
                    RelativeAxisType::REL_HWHEEL => Some(InputEvent::Scroll {
                        dx: delta,
                        dy: 0.0,
                        x,
                        y,
                    }),
                    _ => None,
                }
            }
            InputEventKind::Synchronization(Synchronization::SYN_REPORT) if self.moved => {
                self.moved = false;
                Some(InputEvent::pointer(self.pointer.x, self.pointer.y))
            }
            _ => None,
        }
    }
}

fn mouse_button(key: Key) -> Option<MouseButton> {
    match key {
        Key::BTN_LEFT => Some(MouseButton::Left),
        Key::BTN_RIGHT => Some(MouseButton::Right),
        Key::BTN_MIDDLE => Some(MouseButton::Middle),
        Key::BTN_SIDE => Some(MouseButton::Back),
        Key::BTN_EXTRA => Some(MouseButton::Forward),
        _ => None,
    }
}

/// Keyboard and pointer capture from every readable evdev device.
pub struct EvdevBackend {
    devices: Vec<(PathBuf, evdev::Device)>,
    clock: BackendClock,
    translator: EventTranslator,
    pending: VecDeque<Captured<InputEvent>>,
}

impl EvdevBackend {
    /// Open every keyboard (has `KEY_A`) and relative pointer (has
    /// `BTN_LEFT` and `REL_X`) the process can read.
    pub fn open() -> RecorderResult<Self> {
        let mut devices = Vec::new();
        for (path, device) in evdev::enumerate() {
            let keyboard = device
                .supported_keys()
                .is_some_and(|keys| keys.contains(Key::KEY_A));
            let pointer = device
                .supported_keys()
                .is_some_and(|keys| keys.contains(Key::BTN_LEFT))
                && device
                    .supported_relative_axes()
                    .is_some_and(|axes| axes.contains(RelativeAxisType::REL_X));
            if !keyboard && !pointer {
                continue;
            }
            if let Err(e) = set_nonblocking(&device) {
                tracing::warn!(path = %path.display(), error = %e, "Skipping input device");
                continue;
            }
            tracing::debug!(
                path = %path.display(),
                name = device.name().unwrap_or("unnamed"),
                keyboard,
                pointer,
                "Opened input device"
            );
            devices.push((path, device));
        }

        if devices.is_empty() {
            return Err(RecorderError::unsupported(
                "no readable keyboard or pointer under /dev/input",
            ));
        }
        Ok(Self {
            devices,
            clock: BackendClock::new(),
            translator: EventTranslator::new(Pointer::centered(desktop_size())),
            pending: VecDeque::new(),
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn ingest(&mut self) -> RecorderResult<()> {
        let mut lost = Vec::new();
        for (index, (path, device)) in self.devices.iter_mut().enumerate() {
            let events = match device.fetch_events() {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Input device went away");
                    lost.push(index);
                    continue;
                }
            };
            let now = self.clock.now_ns();
            for event in events {
                if let Some(input) = self.translator.translate(&event) {
                    self.pending.push_back(Captured::new(now, input));
                }
            }
        }
        for index in lost.into_iter().rev() {
            self.devices.remove(index);
        }
        if self.devices.is_empty() {
            return Err(RecorderError::capture("every input device went away"));
        }
        Ok(())
    }
}

impl InputBackend for EvdevBackend {
    fn poll(&mut self) -> RecorderResult<Option<Captured<InputEvent>>> {
        if self.pending.is_empty() {
            self.ingest()?;
        }
        Ok(self.pending.pop_front())
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        Ok(self.clock.now_ns())
    }

    fn name(&self) -> &str {
        "evdev"
    }

    fn is_available(&self) -> bool {
        !self.devices.is_empty()
    }
}

fn set_nonblocking(device: &evdev::Device) -> std::io::Result<()> {
    let fd = device.as_raw_fd();
    // SAFETY: `fd` stays owned by `device` for the duration of both calls.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Pointer-only fallback reading the legacy mixed PS/2 stream.
pub struct MiceBackend {
    device: std::fs::File,
    clock: BackendClock,
    pending: VecDeque<Captured<InputEvent>>,
    pointer: Pointer,
    button_state: [bool; 3],
}

impl MiceBackend {
    pub fn new() -> RecorderResult<Self> {
        let device = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(MICE_DEVICE)
            .map_err(|e| RecorderError::capture(format!("Failed to open {MICE_DEVICE}: {e}")))?;

        Ok(Self {
            device,
            clock: BackendClock::new(),
            pending: VecDeque::new(),
            pointer: Pointer::centered(desktop_size()),
            button_state: [false, false, false],
        })
    }

    pub fn is_supported() -> bool {
        OpenOptions::new().read(true).open(MICE_DEVICE).is_ok()
    }

    fn ingest_packets(&mut self) -> RecorderResult<()> {
        loop {
            let mut packet = [0u8; 3];
            match self.device.read(&mut packet) {
                Ok(3) => {
                    let now = self.clock.now_ns();
                    self.process_packet(now, packet);
                }
                Ok(_) => break,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    return Err(RecorderError::capture(format!(
                        "Failed reading {MICE_DEVICE}: {err}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn process_packet(&mut self, native_ns: u64, packet: [u8; 3]) {
        let dx = packet[1] as i8 as f64;
        let dy = packet[2] as i8 as f64;

        if dx != 0.0 || dy != 0.0 {
            // PS/2 reports Y upwards.
            self.pointer.shift(dx, -dy);
            self.pending.push_back(Captured::new(
                native_ns,
                InputEvent::pointer(self.pointer.x, self.pointer.y),
            ));
        }

        let left = packet[0] & 0b001 != 0;
        let right = packet[0] & 0b010 != 0;
        let middle = packet[0] & 0b100 != 0;

        self.push_button_transition(native_ns, LEFT_BUTTON, left, MouseButton::Left);
        self.push_button_transition(native_ns, RIGHT_BUTTON, right, MouseButton::Right);
        self.push_button_transition(native_ns, MIDDLE_BUTTON, middle, MouseButton::Middle);
    }

    fn push_button_transition(&mut self, native_ns: u64, idx: usize, now: bool, button: MouseButton) {
        let previous = self.button_state[idx];
        if previous == now {
            return;
        }

        self.button_state[idx] = now;
        let state = if now {
            ButtonState::Down
        } else {
            ButtonState::Up
        };
        self.pending.push_back(Captured::new(
            native_ns,
            InputEvent::click(button, state, self.pointer.x, self.pointer.y),
        ));
    }
}

impl InputBackend for MiceBackend {
    fn poll(&mut self) -> RecorderResult<Option<Captured<InputEvent>>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        self.ingest_packets()?;
        Ok(self.pending.pop_front())
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        Ok(self.clock.now_ns())
    }

    fn name(&self) -> &str {
        "mice"
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Detect the best available input backend for the current system.
pub fn detect_best_backend() -> RecorderResult<Box<dyn InputBackend>> {
    match EvdevBackend::open() {
        Ok(backend) => {
            tracing::info!(devices = backend.device_count(), "Using evdev backend");
            return Ok(Box::new(backend));
        }
        Err(e) => tracing::warn!(error = %e, "No evdev devices; trying {MICE_DEVICE}"),
    }

    if MiceBackend::is_supported() {
        match MiceBackend::new() {
            Ok(backend) => {
                tracing::warn!("Using {MICE_DEVICE}; keyboard events will not be captured");
                return Ok(Box::new(backend));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open {MICE_DEVICE}, using idle backend");
            }
        }
    }

    tracing::warn!(
        details = %mice_device_diagnostic(),
        "Using idle input backend; keyboard and pointer events will not be captured"
    );
    Ok(Box::new(ScriptedInputBackend::empty("idle")))
}

fn mice_device_diagnostic() -> String {
    let uid = unsafe { libc::geteuid() };
    let gid = unsafe { libc::getegid() };

    match std::fs::metadata(MICE_DEVICE) {
        Ok(meta) => {
            let mode = meta.mode() & 0o777;
            let owner = meta.uid();
            let group = meta.gid();
            format!(
                "device={MICE_DEVICE} mode={mode:o} owner_uid={owner} owner_gid={group} process_uid={uid} process_gid={gid}; likely missing 'input' group membership. Fix: sudo usermod -aG input $USER && log out/in"
            )
        }
        Err(err) => format!(
            "device={MICE_DEVICE} unavailable ({err}); ensure kernel input device exists and permissions allow read access"
        ),
    }
}

fn desktop_size() -> (f64, f64) {
    run_tool("xwininfo", &["-root"])
        .and_then(|out| parse_xwininfo_geometry(&out))
        .map(|(_, _, w, h)| (w as f64, h as f64))
        .unwrap_or((1920.0, 1080.0))
}

/// Tracks the X11 active window by polling window properties.
pub struct X11WindowBackend {
    clock: BackendClock,
    pending: VecDeque<Captured<WindowEvent>>,
    active: Option<String>,
    geometry: Option<(i32, i32, u32, u32)>,
}

impl X11WindowBackend {
    pub fn new() -> RecorderResult<Self> {
        if std::env::var("DISPLAY").is_err() {
            return Err(RecorderError::unsupported("DISPLAY is not set; X11 window tracking unavailable"));
        }
        if run_tool("xprop", &["-root", "_NET_ACTIVE_WINDOW"]).is_none() {
            return Err(RecorderError::unsupported("xprop is not installed or the X server refused the query"));
        }
        Ok(Self {
            clock: BackendClock::new(),
            pending: VecDeque::new(),
            active: None,
            geometry: None,
        })
    }

    fn refresh(&mut self) {
        let now = self.clock.now_ns();
        let Some(window_id) = run_tool("xprop", &["-root", "_NET_ACTIVE_WINDOW"])
            .and_then(|out| parse_active_window(&out))
        else {
            return;
        };

        if self.active.as_deref() != Some(window_id.as_str()) {
            let props = run_tool("xprop", &["-id", &window_id, "_NET_WM_NAME", "WM_CLASS", "_NET_WM_PID"])
                .unwrap_or_default();
            let title = parse_quoted_property(&props, "_NET_WM_NAME").unwrap_or_default();
            let app_id = parse_quoted_property(&props, "WM_CLASS");
            let pid = parse_numeric_property(&props, "_NET_WM_PID");
            tracing::debug!(window = %window_id, %title, "Focus changed");
            self.pending
                .push_back(Captured::new(now, WindowEvent::focus(title, app_id, pid)));
            self.active = Some(window_id.clone());
            self.geometry = None;
        }

        let geometry = run_tool("xwininfo", &["-id", &window_id])
            .and_then(|out| parse_xwininfo_geometry(&out));
        if let Some(g) = geometry {
            if self.geometry != Some(g) {
                let (x, y, width, height) = g;
                self.pending.push_back(Captured::new(
                    now,
                    WindowEvent::Geometry {
                        x,
                        y,
                        width,
                        height,
                    },
                ));
                self.geometry = Some(g);
            }
        }
    }
}

impl WindowBackend for X11WindowBackend {
    fn poll(&mut self) -> RecorderResult<Option<Captured<WindowEvent>>> {
        if self.pending.is_empty() {
            self.refresh();
        }
        Ok(self.pending.pop_front())
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        Ok(self.clock.now_ns())
    }

    fn name(&self) -> &str {
        "x11"
    }
}

/// Open the window backend for this session.
pub fn detect_window_backend() -> RecorderResult<Box<dyn WindowBackend>> {
    let backend = X11WindowBackend::new()?;
    tracing::info!("Using X11 window backend");
    Ok(Box::new(backend))
}

/// Pointer acceleration and key repeat settings of the X server. Empty
/// when `xset` is missing or there is no display. Runs a helper process.
pub fn read_environment() -> SessionEnvironment {
    let Some(query) = run_tool("xset", &["q"]) else {
        tracing::debug!("xset unavailable; no input environment recorded");
        return SessionEnvironment::default();
    };
    parse_xset_query(&query)
}

/// Relevant lines of `xset q`:
///
/// ```text
///   auto repeat:  on    key click percent:  0    LED mask:  00000000
///   auto repeat delay:  660    repeat rate:  25
///   acceleration:  2/1    threshold:  4
/// ```
fn parse_xset_query(output: &str) -> SessionEnvironment {
    let value_after = |label: &str| -> Option<&str> {
        let line = output.lines().find(|l| l.contains(label))?;
        let rest = &line[line.find(label)? + label.len()..];
        rest.split_whitespace().next()
    };

    let pointer_ballistics = value_after("acceleration:").and_then(|ratio| {
        let (num, den) = ratio.split_once('/').unwrap_or((ratio, "1"));
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        Some(PointerBallistics {
            acceleration: if den == 0.0 { num } else { num / den },
            threshold: value_after("threshold:")?.parse().ok()?,
        })
    });

    let keyboard_repeat = (|| {
        Some(KeyboardRepeat {
            enabled: value_after("auto repeat:")? == "on",
            delay_ms: value_after("auto repeat delay:")?.parse().ok()?,
            rate_hz: value_after("repeat rate:")?.parse().ok()?,
        })
    })();

    SessionEnvironment {
        pointer_ballistics,
        keyboard_repeat,
    }
}

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `_NET_ACTIVE_WINDOW(WINDOW): window id # 0x3a00007` → `0x3a00007`.
fn parse_active_window(output: &str) -> Option<String> {
    let id = output.split('#').nth(1)?.trim();
    let id = id.split(',').next()?.trim();
    if id.is_empty() || id == "0x0" {
        return None;
    }
    Some(id.to_string())
}

/// `WM_CLASS(STRING) = "code", "Code"` → `code`.
fn parse_quoted_property(output: &str, name: &str) -> Option<String> {
    let line = output.lines().find(|l| l.starts_with(name))?;
    let value = line.split_once('=')?.1;
    let start = value.find('"')? + 1;
    let end = start + value[start..].find('"')?;
    Some(value[start..end].to_string())
}

/// `_NET_WM_PID(CARDINAL) = 4242` → `4242`.
fn parse_numeric_property(output: &str, name: &str) -> Option<u32> {
    let line = output.lines().find(|l| l.starts_with(name))?;
    line.split_once('=')?.1.trim().parse().ok()
}

/// Absolute position and size from `xwininfo` output.
fn parse_xwininfo_geometry(output: &str) -> Option<(i32, i32, u32, u32)> {
    let field = |label: &str| -> Option<i64> {
        let line = output.lines().find(|l| l.trim_start().starts_with(label))?;
        line.split_once(':')?.1.trim().parse().ok()
    };
    Some((
        field("Absolute upper-left X")? as i32,
        field("Absolute upper-left Y")? as i32,
        field("Width")? as u32,
        field("Height")? as u32,
    ))
}
