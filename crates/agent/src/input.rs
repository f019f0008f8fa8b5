use crate::capture::resolve_region;

use anyhow::Context;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_protocol::{CaptureRegion, InputCommand};
use tracing::{debug, info, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::xproto;
use x11rb::protocol::xtest;
use x11rb::rust_connection::RustConnection;

/// Consumer of remote input commands. The coordinator enables it while at
/// least one session is active and hands it raw data-channel text.
pub trait InputExecutor: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    fn is_enabled(&self) -> bool;
    fn execute(&self, command: &str) -> anyhow::Result<()>;
}

/// Used when no X display is reachable: commands are parsed and logged.
#[derive(Default)]
pub struct LogOnlyExecutor {
    enabled: AtomicBool,
}

impl InputExecutor for LogOnlyExecutor {
    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        info!("Input executor enabled (log only)");
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("Input executor disabled (log only)");
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn execute(&self, command: &str) -> anyhow::Result<()> {
        let cmd: InputCommand = serde_json::from_str(command).context("Invalid input command")?;
        debug!(?cmd, "Input command (not injected)");
        Ok(())
    }
}

/// Injects keyboard, mouse and scroll events through the X11 XTEST
/// extension. Keys and buttons still held when the executor is disabled
/// are released so a dropped viewer cannot leave a modifier stuck.
pub struct XtestExecutor {
    injector: Mutex<XtestInjector>,
    enabled: AtomicBool,
}

impl XtestExecutor {
    /// `region` is the captured area pointer coordinates are relative to;
    /// `None` means the whole screen.
    pub fn new(x_display: &str, region: Option<CaptureRegion>) -> anyhow::Result<Self> {
        Ok(Self {
            injector: Mutex::new(XtestInjector::new(x_display, region)?),
            enabled: AtomicBool::new(false),
        })
    }

    fn injector(&self) -> std::sync::MutexGuard<'_, XtestInjector> {
        self.injector.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl InputExecutor for XtestExecutor {
    fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("Input injection enabled");
        }
    }

    fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.injector().release_all() {
                warn!(error = %e, "Failed to release held input");
            }
            info!("Input injection disabled");
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn execute(&self, command: &str) -> anyhow::Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let cmd: InputCommand = serde_json::from_str(command).context("Invalid input command")?;
        self.injector().apply(cmd)
    }
}

struct XtestInjector {
    conn: RustConnection,
    root: xproto::Window,
    region: CaptureRegion,
    held_keys: BTreeSet<u8>,
    held_buttons: BTreeSet<u8>,
    /// Fractional scroll carried between events (trackpads send small deltas).
    scroll_accum_x: f64,
    scroll_accum_y: f64,
}

impl XtestInjector {
    fn new(x_display: &str, region: Option<CaptureRegion>) -> anyhow::Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(Some(x_display)).context("Failed to connect to X display")?;
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let region = resolve_region(
            region,
            screen.width_in_pixels as u32,
            screen.height_in_pixels as u32,
        )?;

        let _ = conn
            .extension_information(xtest::X11_EXTENSION_NAME)
            .context("Failed to query XTEST extension")?
            .ok_or_else(|| anyhow::anyhow!("XTEST extension not available"))?;

        info!(display = x_display, "Input injector initialized via XTEST");
        Ok(Self {
            conn,
            root,
            region,
            held_keys: BTreeSet::new(),
            held_buttons: BTreeSet::new(),
            scroll_accum_x: 0.0,
            scroll_accum_y: 0.0,
        })
    }

    fn apply(&mut self, cmd: InputCommand) -> anyhow::Result<()> {
        match cmd {
            InputCommand::Key { c, d } => self.key(c, d)?,
            InputCommand::MouseMove { x, y } => self.move_abs(x, y)?,
            InputCommand::Button { b, d } => self.button(map_button(b)?, d)?,
            InputCommand::Scroll { dx, dy } => self.scroll(dx, dy)?,
        }
        self.conn.flush()?;
        Ok(())
    }

    fn fake(&self, event_type: u8, detail: u8, x: i16, y: i16) -> anyhow::Result<()> {
        xtest::fake_input(&self.conn, event_type, detail, 0, self.root, x, y, 0)?;
        Ok(())
    }

    /// `code` is a Linux evdev keycode; X11 keycodes are offset by 8.
    fn key(&mut self, code: u16, pressed: bool) -> anyhow::Result<()> {
        let x_keycode = u8::try_from(code.saturating_add(8)).context("Keycode out of range")?;
        if pressed {
            self.fake(xproto::KEY_PRESS_EVENT, x_keycode, 0, 0)?;
            self.held_keys.insert(x_keycode);
        } else {
            self.fake(xproto::KEY_RELEASE_EVENT, x_keycode, 0, 0)?;
            self.held_keys.remove(&x_keycode);
        }
        Ok(())
    }

    /// Normalized [0, 1] coordinates relative to the captured region.
    fn move_abs(&mut self, x: f64, y: f64) -> anyhow::Result<()> {
        let (px, py) = region_point(self.region, x, y);
        self.fake(xproto::MOTION_NOTIFY_EVENT, 0, px, py)
    }

    fn button(&mut self, x_button: u8, pressed: bool) -> anyhow::Result<()> {
        if pressed {
            self.fake(xproto::BUTTON_PRESS_EVENT, x_button, 0, 0)?;
            self.held_buttons.insert(x_button);
        } else {
            self.fake(xproto::BUTTON_RELEASE_EVENT, x_button, 0, 0)?;
            self.held_buttons.remove(&x_button);
        }
        Ok(())
    }

    fn click(&self, x_button: u8, count: u32) -> anyhow::Result<()> {
        for _ in 0..count {
            self.fake(xproto::BUTTON_PRESS_EVENT, x_button, 0, 0)?;
            self.fake(xproto::BUTTON_RELEASE_EVENT, x_button, 0, 0)?;
        }
        Ok(())
    }

    /// Buttons 4/5 scroll vertically and 6/7 horizontally; one click per notch.
    fn scroll(&mut self, dx: f64, dy: f64) -> anyhow::Result<()> {
        if !(-10000.0..=10000.0).contains(&dx) || !(-10000.0..=10000.0).contains(&dy) {
            anyhow::bail!("Scroll delta out of range: ({dx}, {dy})");
        }
        if dy.abs() > 0.001 {
            let notches = accumulate_scroll(&mut self.scroll_accum_y, -dy / 30.0);
            let button = if notches > 0 { 4 } else { 5 };
            self.click(button, notches.unsigned_abs())?;
        }
        if dx.abs() > 0.001 {
            let notches = accumulate_scroll(&mut self.scroll_accum_x, dx / 30.0);
            let button = if notches > 0 { 7 } else { 6 };
            self.click(button, notches.unsigned_abs())?;
        }
        Ok(())
    }

    fn release_all(&mut self) -> anyhow::Result<()> {
        for key in std::mem::take(&mut self.held_keys) {
            self.fake(xproto::KEY_RELEASE_EVENT, key, 0, 0)?;
        }
        for button in std::mem::take(&mut self.held_buttons) {
            self.fake(xproto::BUTTON_RELEASE_EVENT, button, 0, 0)?;
        }
        self.scroll_accum_x = 0.0;
        self.scroll_accum_y = 0.0;
        self.conn.flush()?;
        Ok(())
    }
}

fn region_point(region: CaptureRegion, x: f64, y: f64) -> (i16, i16) {
    let px = region.x as f64 + x.clamp(0.0, 1.0) * region.width.saturating_sub(1) as f64;
    let py = region.y as f64 + y.clamp(0.0, 1.0) * region.height.saturating_sub(1) as f64;
    (px.round() as i16, py.round() as i16)
}

/// Browser button index to X11 button: 0=left, 1=middle, 2=right.
fn map_button(button: u8) -> anyhow::Result<u8> {
    match button {
        0 => Ok(1),
        1 => Ok(2),
        2 => Ok(3),
        _ => anyhow::bail!("Unknown mouse button: {button}"),
    }
}

/// Add `notches` to the accumulator and take out the whole part.
fn accumulate_scroll(accum: &mut f64, notches: f64) -> i32 {
    *accum += notches;
    let discrete = *accum as i32;
    if discrete != 0 {
        *accum -= discrete as f64;
    }
    discrete
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buttons_map_to_x11() {
        assert_eq!(map_button(0).unwrap(), 1);
        assert_eq!(map_button(1).unwrap(), 2);
        assert_eq!(map_button(2).unwrap(), 3);
        assert!(map_button(3).is_err());
        assert!(map_button(255).is_err());
    }

    #[test]
    fn scroll_single_notch() {
        let mut accum = 0.0;
        assert_eq!(accumulate_scroll(&mut accum, 1.0), 1);
        assert!(accum.abs() < 0.001);
        assert_eq!(accumulate_scroll(&mut accum, -1.0), -1);
        assert!(accum.abs() < 0.001);
    }

    #[test]
    fn scroll_fractions_accumulate() {
        let mut accum = 0.0;
        assert_eq!(accumulate_scroll(&mut accum, 0.3), 0);
        assert_eq!(accumulate_scroll(&mut accum, 0.3), 0);
        assert_eq!(accumulate_scroll(&mut accum, 0.3), 0);
        assert_eq!(accumulate_scroll(&mut accum, 0.3), 1);
        assert!((accum - 0.2).abs() < 0.001);
    }

    #[test]
    fn scroll_large_jump_keeps_remainder() {
        let mut accum = 0.0;
        assert_eq!(accumulate_scroll(&mut accum, 5.7), 5);
        assert!((accum - 0.7).abs() < 0.001);
    }

    #[test]
    fn scroll_direction_change_cancels() {
        let mut accum = 0.0;
        accumulate_scroll(&mut accum, 0.5);
        accumulate_scroll(&mut accum, -0.5);
        assert!(accum.abs() < 0.001);
    }

    #[test]
    fn pointer_maps_into_region() {
        let region = CaptureRegion {
            x: 100,
            y: 50,
            width: 801,
            height: 601,
        };
        assert_eq!(region_point(region, 0.0, 0.0), (100, 50));
        assert_eq!(region_point(region, 1.0, 1.0), (900, 650));
        assert_eq!(region_point(region, 0.5, 0.5), (500, 350));
        assert_eq!(region_point(region, -3.0, 7.0), (100, 650));
    }

    #[test]
    fn log_only_tracks_enabled_and_validates() {
        let exec = LogOnlyExecutor::default();
        assert!(!exec.is_enabled());
        exec.enable();
        assert!(exec.is_enabled());
        assert!(exec.execute(r#"{"t":"m","x":0.5,"y":0.5}"#).is_ok());
        assert!(exec.execute(r#"{"t":"k","c":30,"d":true}"#).is_ok());
        assert!(exec.execute("not json").is_err());
        exec.disable();
        assert!(!exec.is_enabled());
    }
}
