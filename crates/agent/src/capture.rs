use crate::pipeline::{CaptureError, RawFrame, ScreenSource};

use anyhow::{Context, bail};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tether_protocol::CaptureRegion;
use tracing::{debug, info};
use x11rb::connection::Connection;
use x11rb::protocol::shm;
use x11rb::protocol::xproto::{ImageFormat, Screen};
use x11rb::rust_connection::RustConnection;

const BYTES_PER_PIXEL: u32 = 4; // BGRx

/// Check that `region` lies inside a `width`x`height` screen.
/// `None` means the whole screen.
pub fn resolve_region(
    region: Option<CaptureRegion>,
    width: u32,
    height: u32,
) -> anyhow::Result<CaptureRegion> {
    let Some(r) = region else {
        return Ok(CaptureRegion {
            x: 0,
            y: 0,
            width,
            height,
        });
    };
    if r.width == 0 || r.height == 0 {
        bail!("Capture region has zero size");
    }
    let fits_x = r.x.checked_add(r.width).is_some_and(|right| right <= width);
    let fits_y = r.y.checked_add(r.height).is_some_and(|bottom| bottom <= height);
    if !fits_x || !fits_y {
        bail!(
            "Capture region {}x{}+{}+{} exceeds screen {width}x{height}",
            r.width,
            r.height,
            r.x,
            r.y
        );
    }
    Ok(r)
}

/// X11 MIT-SHM grabber for one fixed region of the root window.
pub struct ScreenCapture {
    conn: RustConnection,
    root: u32,
    region: CaptureRegion,
    shm_seg: shm::Seg,
    shm_ptr: *mut u8,
    shm_size: usize,
}

// SAFETY: The SHM pointer is only accessed through &mut self methods,
// so there is no concurrent access.
unsafe impl Send for ScreenCapture {}

impl ScreenCapture {
    pub fn new(x_display: &str, region: Option<CaptureRegion>) -> anyhow::Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(Some(x_display)).context("Failed to connect to X display")?;

        shm::query_version(&conn)
            .context("SHM extension not available")?
            .reply()
            .context("SHM query_version failed")?;

        let screen: &Screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let screen_width = screen.width_in_pixels as u32;
        let screen_height = screen.height_in_pixels as u32;
        let region = resolve_region(region, screen_width, screen_height)?;

        info!(
            x_display,
            screen_width,
            screen_height,
            width = region.width,
            height = region.height,
            x = region.x,
            y = region.y,
            "Connected to X display"
        );

        let shm_size = (region.width * region.height * BYTES_PER_PIXEL) as usize;

        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, shm_size, libc::IPC_CREAT | 0o600) };
        if shm_id < 0 {
            bail!("shmget failed: {}", std::io::Error::last_os_error());
        }

        let shm_ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if shm_ptr == usize::MAX as *mut libc::c_void {
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
            bail!("shmat failed: {}", std::io::Error::last_os_error());
        }

        // Removed by the kernel once both sides detach.
        unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };

        let attach = conn
            .generate_id()
            .context("Failed to generate SHM seg id")
            .and_then(|seg| {
                shm::attach(&conn, seg, shm_id as u32, false)
                    .context("SHM attach request failed")?
                    .check()
                    .context("SHM attach failed")?;
                Ok(seg)
            });
        let shm_seg = match attach {
            Ok(seg) => seg,
            Err(e) => {
                unsafe { libc::shmdt(shm_ptr) };
                return Err(e);
            }
        };
        debug!(shm_seg, shm_size, "SHM segment attached");

        Ok(Self {
            conn,
            root,
            region,
            shm_seg,
            shm_ptr: shm_ptr as *mut u8,
            shm_size,
        })
    }

    pub fn capture_frame(&mut self) -> anyhow::Result<RawFrame> {
        let r = self.region;
        shm::get_image(
            &self.conn,
            self.root,
            r.x as i16,
            r.y as i16,
            r.width as u16,
            r.height as u16,
            !0,
            ImageFormat::Z_PIXMAP.into(),
            self.shm_seg,
            0,
        )
        .context("SHM GetImage request failed")?
        .reply()
        .context("SHM GetImage reply failed")?;

        // SAFETY: The segment is attached and exactly shm_size bytes long;
        // &mut self rules out concurrent access.
        let shm_slice = unsafe { std::slice::from_raw_parts(self.shm_ptr, self.shm_size) };
        let mut data = shm_slice.to_vec();

        // Depth-24 visuals leave byte 3 undefined; encoders fed BGRA would
        // read it as alpha.
        for pixel in data.chunks_exact_mut(4) {
            pixel[3] = 0xFF;
        }

        Ok(RawFrame {
            width: r.width,
            height: r.height,
            data: Bytes::from(data),
        })
    }

    pub fn into_source(self) -> X11Source {
        X11Source {
            capture: Arc::new(Mutex::new(self)),
        }
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        let _ = shm::detach(&self.conn, self.shm_seg);
        let _ = self.conn.flush();
        unsafe {
            libc::shmdt(self.shm_ptr as *const libc::c_void);
        }
        debug!("SHM segment detached");
    }
}

/// Async adapter running each grab on the blocking pool.
pub struct X11Source {
    capture: Arc<Mutex<ScreenCapture>>,
}

#[async_trait::async_trait]
impl ScreenSource for X11Source {
    async fn capture(&mut self) -> Result<RawFrame, CaptureError> {
        let capture = Arc::clone(&self.capture);
        tokio::task::spawn_blocking(move || {
            capture
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .capture_frame()
        })
        .await
        .map_err(|e| CaptureError::Capture(format!("capture task: {e}")))?
        .map_err(|e| CaptureError::Capture(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: u32, y: u32, width: u32, height: u32) -> CaptureRegion {
        CaptureRegion {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn whole_screen_by_default() {
        assert_eq!(
            resolve_region(None, 1920, 1080).unwrap(),
            region(0, 0, 1920, 1080)
        );
    }

    #[test]
    fn region_inside_screen_is_kept() {
        let r = region(100, 50, 800, 600);
        assert_eq!(resolve_region(Some(r), 1920, 1080).unwrap(), r);
        let edge = region(1120, 480, 800, 600);
        assert_eq!(resolve_region(Some(edge), 1920, 1080).unwrap(), edge);
    }

    #[test]
    fn region_outside_screen_is_rejected() {
        assert!(resolve_region(Some(region(1200, 0, 800, 600)), 1920, 1080).is_err());
        assert!(resolve_region(Some(region(0, 500, 800, 600)), 1920, 1080).is_err());
        assert!(resolve_region(Some(region(u32::MAX, 0, 2, 2)), 1920, 1080).is_err());
        assert!(resolve_region(Some(region(0, 0, 0, 10)), 1920, 1080).is_err());
    }
}
