//! Desktop frame source.
//!
//! Enumerates monitors, owns the platform capturer and a bounded queue of
//! RGBA frames, and runs the capture loop at the target framerate on a
//! dedicated thread. When the consumer falls behind, the newest frame is
//! dropped: the queue exists only to absorb one scheduling jitter, and
//! dropping new frames keeps end-to-end latency flat.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::frame::Frame;

/// Frames buffered between the capture loop and the delivery pump.
pub const FRAME_QUEUE_DEPTH: usize = 2;

/// A single physical monitor in virtual-desktop coordinates. Origins may
/// be negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub index: usize,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub primary: bool,
}

/// All monitors plus the derived virtual bounding rectangle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSet {
    pub monitors: Vec<Monitor>,
    pub virtual_x: i32,
    pub virtual_y: i32,
    pub virtual_width: u32,
    pub virtual_height: u32,
}

impl MonitorSet {
    /// Derive the virtual desktop bounds as the union of monitor rects.
    pub fn from_monitors(monitors: Vec<Monitor>) -> Self {
        if monitors.is_empty() {
            return Self::default();
        }
        let min_x = monitors.iter().map(|m| m.x).min().unwrap_or(0);
        let min_y = monitors.iter().map(|m| m.y).min().unwrap_or(0);
        let max_x = monitors.iter().map(|m| m.x + m.width as i32).max().unwrap_or(0);
        let max_y = monitors.iter().map(|m| m.y + m.height as i32).max().unwrap_or(0);
        Self {
            monitors,
            virtual_x: min_x,
            virtual_y: min_y,
            virtual_width: (max_x - min_x) as u32,
            virtual_height: (max_y - min_y) as u32,
        }
    }

    /// Whether `selection` refers to a monitor this set actually has.
    pub fn contains(&self, selection: MonitorSelection) -> bool {
        match selection {
            MonitorSelection::VirtualDesktop => !self.monitors.is_empty(),
            MonitorSelection::Monitor(i) => i < self.monitors.len(),
        }
    }
}

/// What the frame source captures and what inbound coordinates refer to:
/// a single monitor, or the composite of all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSelection {
    Monitor(usize),
    VirtualDesktop,
}

impl MonitorSelection {
    /// Operator-side encoding: −1 selects the virtual desktop; other
    /// negative values are invalid.
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            -1 => Some(Self::VirtualDesktop),
            i if i >= 0 => Some(Self::Monitor(i as usize)),
            _ => None,
        }
    }
}

/// One rectangle to grab from the desktop and where it lands on the
/// output canvas.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CaptureRegion {
    src_x: i32,
    src_y: i32,
    width: u32,
    height: u32,
    dst_x: u32,
    dst_y: u32,
}

/// Canvas dimensions and grab regions for a selection. For the virtual
/// desktop each monitor is blitted at `origin − virtual_min_origin`;
/// gaps between monitors stay black.
fn capture_plan(
    selection: MonitorSelection,
    monitors: &MonitorSet,
) -> (u32, u32, Vec<CaptureRegion>) {
    match selection {
        MonitorSelection::Monitor(i) => {
            let m = &monitors.monitors[i];
            let region = CaptureRegion {
                src_x: m.x,
                src_y: m.y,
                width: m.width,
                height: m.height,
                dst_x: 0,
                dst_y: 0,
            };
            (m.width, m.height, vec![region])
        }
        MonitorSelection::VirtualDesktop => {
            let regions = monitors
                .monitors
                .iter()
                .map(|m| CaptureRegion {
                    src_x: m.x,
                    src_y: m.y,
                    width: m.width,
                    height: m.height,
                    dst_x: (m.x - monitors.virtual_x) as u32,
                    dst_y: (m.y - monitors.virtual_y) as u32,
                })
                .collect();
            (monitors.virtual_width, monitors.virtual_height, regions)
        }
    }
}

/// Platform-specific pixel grabber. Rebuilt whenever the monitor
/// selection changes.
trait PlatformCapturer: Send {
    fn capture(&mut self) -> Result<Frame>;
}

/// Fallback for hosts without a usable display server: emits black frames
/// so a session can still negotiate media.
struct NullCapturer {
    width: u32,
    height: u32,
}

impl PlatformCapturer for NullCapturer {
    fn capture(&mut self) -> Result<Frame> {
        Ok(Frame::black(self.width, self.height))
    }
}

struct SourceState {
    selection: MonitorSelection,
    monitors: MonitorSet,
    capturer: Option<Box<dyn PlatformCapturer>>,
}

/// The frame source. `start` launches the capture loop; `set_monitor`
/// atomically swaps the capture region; `stop` tears everything down.
pub struct ScreenCapture {
    display: String,
    target_fps: u32,
    state: Arc<Mutex<SourceState>>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ScreenCapture {
    pub fn new(display: &str, target_fps: u32) -> Self {
        Self {
            display: display.to_string(),
            target_fps,
            state: Arc::new(Mutex::new(SourceState {
                selection: MonitorSelection::Monitor(0),
                monitors: MonitorSet::default(),
                capturer: None,
            })),
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            thread: Mutex::new(None),
        }
    }

    /// Enumerate monitors, initialize the platform capturer for the
    /// current selection, and launch the capture loop. Returns the
    /// receiving end of the bounded frame queue.
    pub fn start(&self) -> Result<mpsc::Receiver<Frame>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::State("frame source already running".into()));
        }

        let monitors = enumerate_monitors(&self.display);
        for m in &monitors.monitors {
            info!(
                index = m.index,
                name = %m.name,
                width = m.width,
                height = m.height,
                x = m.x,
                y = m.y,
                primary = m.primary,
                "Detected monitor"
            );
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !monitors.contains(state.selection) {
                state.selection = MonitorSelection::Monitor(0);
            }
            let capturer = match build_capturer(&self.display, state.selection, &monitors) {
                Ok(capturer) => capturer,
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };
            state.monitors = monitors;
            state.capturer = Some(capturer);
        }

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE_DEPTH);
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let dropped = Arc::clone(&self.dropped);
        let interval = Duration::from_secs(1) / self.target_fps;

        let handle = std::thread::Builder::new()
            .name("screen-capture".into())
            .spawn(move || {
                let mut consecutive_failures = 0u32;
                while running.load(Ordering::Relaxed) {
                    let tick_start = Instant::now();

                    let frame = {
                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        match state.capturer.as_mut() {
                            Some(capturer) => capturer.capture(),
                            None => Err(AgentError::Platform("no capturer".into())),
                        }
                    };

                    match frame {
                        Ok(frame) => {
                            consecutive_failures = 0;
                            if !enqueue_frame(&frame_tx, frame, &dropped) {
                                info!("Frame queue closed, capture loop exiting");
                                break;
                            }
                        }
                        Err(e) => {
                            // Single-frame failures are skipped; the next
                            // tick usually succeeds (e.g. mid mode change).
                            consecutive_failures += 1;
                            if consecutive_failures <= 3 || consecutive_failures % 150 == 0 {
                                warn!(consecutive_failures, "Capture frame skipped: {e}");
                            }
                        }
                    }

                    let elapsed = tick_start.elapsed();
                    if elapsed < interval {
                        std::thread::sleep(interval - elapsed);
                    }
                }
                debug!("Capture loop stopped");
            })
            .map_err(|e| AgentError::Platform(format!("spawn capture thread: {e}")))?;

        *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(fps = self.target_fps, "Screen capture started");
        Ok(frame_rx)
    }

    /// Stop the capture loop and release the platform capturer. Safe to
    /// call multiple times.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
            let dropped = self.dropped.load(Ordering::Relaxed);
            info!(dropped_frames = dropped, "Screen capture stopped");
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.capturer = None;
    }

    /// Replace the monitor selection. If the loop is running, the platform
    /// capturer is torn down and reinitialized under the source lock. The
    /// queue is not drained; stale frames from the old selection are
    /// allowed to flow through.
    pub fn set_monitor(&self, selection: MonitorSelection) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.monitors.contains(selection) {
            return Err(AgentError::State(format!(
                "monitor selection out of range: {selection:?}"
            )));
        }
        if state.selection == selection {
            return Ok(());
        }
        state.selection = selection;
        if self.running.load(Ordering::Relaxed) {
            state.capturer = None;
            let capturer = build_capturer(&self.display, selection, &state.monitors)?;
            state.capturer = Some(capturer);
            info!(?selection, "Capturer reinitialized for new monitor selection");
        }
        Ok(())
    }

    pub fn monitors(&self) -> MonitorSet {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .monitors
            .clone()
    }

    pub fn selection(&self) -> MonitorSelection {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).selection
    }
}

/// Try to enqueue a captured frame without blocking. Returns false when
/// the consumer side is gone. When the queue is full the new frame is
/// dropped and counted.
fn enqueue_frame(tx: &mpsc::Sender<Frame>, frame: Frame, dropped: &AtomicU64) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(total, "Dropping captured frame (queue full, consumer is behind)");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Build the platform capturer for a selection. Hosts without a display
/// server get the no-op capturer so the session can still negotiate.
fn build_capturer(
    display: &str,
    selection: MonitorSelection,
    monitors: &MonitorSet,
) -> Result<Box<dyn PlatformCapturer>> {
    let (width, height, regions) = capture_plan(selection, monitors);
    #[cfg(target_os = "linux")]
    {
        match x11::X11Capturer::new(display, width, height, regions) {
            Ok(capturer) => return Ok(Box::new(capturer)),
            Err(AgentError::Platform(msg)) if msg.contains("connect") => {
                warn!(display, "X display unavailable ({msg}), emitting black frames");
            }
            Err(e) => return Err(e),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (display, regions);
        warn!("No platform capturer for this OS, emitting black frames");
    }
    Ok(Box::new(NullCapturer { width, height }))
}

/// Enumerate physical monitors. Falls back to a synthetic 1920×1080
/// primary when no display server is reachable.
pub fn enumerate_monitors(display: &str) -> MonitorSet {
    #[cfg(target_os = "linux")]
    {
        match x11::enumerate(display) {
            Ok(set) if !set.monitors.is_empty() => return set,
            Ok(_) => warn!(display, "Display reported no monitors"),
            Err(e) => warn!(display, "Monitor enumeration failed: {e}"),
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = display;
    MonitorSet::from_monitors(vec![Monitor {
        index: 0,
        name: "Monitor 1".to_string(),
        x: 0,
        y: 0,
        width: 1920,
        height: 1080,
        primary: true,
    }])
}

#[cfg(target_os = "linux")]
mod x11 {
    //! X11 capture via the MIT-SHM extension. One SysV segment sized for
    //! the largest grab region is reused for every monitor each tick;
    //! pixels are converted BGRx → RGBA while being blitted onto the
    //! canvas.

    use super::{CaptureRegion, Monitor, MonitorSet, PlatformCapturer};
    use crate::error::{AgentError, Result};
    use crate::frame::{blit, Frame};

    use tracing::{debug, warn};
    use x11rb::connection::Connection;
    use x11rb::protocol::randr;
    use x11rb::protocol::shm;
    use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat};
    use x11rb::rust_connection::RustConnection;

    pub(super) fn enumerate(display: &str) -> Result<MonitorSet> {
        let (conn, screen_num) = RustConnection::connect(Some(display))
            .map_err(|e| AgentError::Platform(format!("connect to X display: {e}")))?;
        let screen = &conn.setup().roots[screen_num];
        let reply = randr::get_monitors(&conn, screen.root, true)
            .map_err(|e| AgentError::Platform(format!("randr request: {e}")))?
            .reply()
            .map_err(|e| AgentError::Platform(format!("randr get_monitors: {e}")))?;

        let mut monitors = Vec::with_capacity(reply.monitors.len());
        for (index, info) in reply.monitors.iter().enumerate() {
            let name = conn
                .get_atom_name(info.name)
                .ok()
                .and_then(|c| c.reply().ok())
                .map(|r| String::from_utf8_lossy(&r.name).into_owned())
                .unwrap_or_else(|| format!("Monitor {}", index + 1));
            monitors.push(Monitor {
                index,
                name,
                x: info.x as i32,
                y: info.y as i32,
                width: info.width as u32,
                height: info.height as u32,
                primary: info.primary,
            });
        }

        if monitors.is_empty() {
            // Servers without RandR monitor info: treat the whole screen
            // as one monitor.
            monitors.push(Monitor {
                index: 0,
                name: "Screen 0".to_string(),
                x: 0,
                y: 0,
                width: screen.width_in_pixels as u32,
                height: screen.height_in_pixels as u32,
                primary: true,
            });
        }

        Ok(MonitorSet::from_monitors(monitors))
    }

    pub(super) struct X11Capturer {
        conn: RustConnection,
        root: u32,
        canvas_width: u32,
        canvas_height: u32,
        regions: Vec<CaptureRegion>,
        shm_seg: shm::Seg,
        shm_ptr: *mut u8,
        shm_size: usize,
    }

    // SAFETY: the SHM pointer is only touched through &mut self, and the
    // capturer lives behind the frame-source lock.
    unsafe impl Send for X11Capturer {}

    impl X11Capturer {
        pub(super) fn new(
            display: &str,
            canvas_width: u32,
            canvas_height: u32,
            regions: Vec<CaptureRegion>,
        ) -> Result<Self> {
            let (conn, screen_num) = RustConnection::connect(Some(display))
                .map_err(|e| AgentError::Platform(format!("connect to X display: {e}")))?;

            shm::query_version(&conn)
                .map_err(|e| AgentError::Platform(format!("SHM request: {e}")))?
                .reply()
                .map_err(|e| AgentError::Platform(format!("SHM extension unavailable: {e}")))?;

            let root = conn.setup().roots[screen_num].root;

            let shm_size = regions
                .iter()
                .map(|r| (r.width * r.height * 4) as usize)
                .max()
                .unwrap_or(0);
            if shm_size == 0 {
                return Err(AgentError::Platform("empty capture plan".into()));
            }

            let shm_id =
                unsafe { libc::shmget(libc::IPC_PRIVATE, shm_size, libc::IPC_CREAT | 0o600) };
            if shm_id < 0 {
                return Err(AgentError::Platform(format!(
                    "shmget failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let shm_ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
            if shm_ptr == usize::MAX as *mut libc::c_void {
                unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
                return Err(AgentError::Platform(format!(
                    "shmat failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            // Mark for removal once all processes detach.
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };

            let shm_seg = conn
                .generate_id()
                .map_err(|e| AgentError::Platform(format!("generate SHM seg id: {e}")))?;
            shm::attach(&conn, shm_seg, shm_id as u32, false)
                .map_err(|e| AgentError::Platform(format!("SHM attach request: {e}")))?
                .check()
                .map_err(|e| AgentError::Platform(format!("SHM attach: {e}")))?;

            debug!(shm_size, regions = regions.len(), "SHM capture segment attached");

            Ok(Self {
                conn,
                root,
                canvas_width,
                canvas_height,
                regions,
                shm_seg,
                shm_ptr: shm_ptr as *mut u8,
                shm_size,
            })
        }

        fn grab_region(&self, region: &CaptureRegion, canvas: &mut Frame) -> Result<()> {
            shm::get_image(
                &self.conn,
                self.root,
                region.src_x as i16,
                region.src_y as i16,
                region.width as u16,
                region.height as u16,
                !0,
                ImageFormat::Z_PIXMAP.into(),
                self.shm_seg,
                0,
            )
            .map_err(|e| AgentError::Platform(format!("SHM GetImage request: {e}")))?
            .reply()
            .map_err(|e| AgentError::Platform(format!("SHM GetImage: {e}")))?;

            let bytes = (region.width * region.height * 4) as usize;
            // SAFETY: the segment is `shm_size` bytes and the server just
            // wrote `bytes <= shm_size` of pixel data into it.
            let shm = unsafe { std::slice::from_raw_parts(self.shm_ptr, bytes.min(self.shm_size)) };

            // X11 depth-24 returns BGRx with undefined padding in byte 3.
            let mut pixels = Frame {
                width: region.width,
                height: region.height,
                data: vec![0u8; bytes],
            };
            for (d, s) in pixels.data.chunks_exact_mut(4).zip(shm.chunks_exact(4)) {
                d[0] = s[2];
                d[1] = s[1];
                d[2] = s[0];
                d[3] = 0xFF;
            }
            blit(canvas, &pixels, region.dst_x, region.dst_y);
            Ok(())
        }
    }

    impl PlatformCapturer for X11Capturer {
        fn capture(&mut self) -> Result<Frame> {
            let mut canvas = Frame::black(self.canvas_width, self.canvas_height);
            let mut grabbed = 0usize;
            let mut last_error = None;
            for region in &self.regions {
                match self.grab_region(region, &mut canvas) {
                    Ok(()) => grabbed += 1,
                    Err(e) => {
                        // A transiently missing monitor stays black; the
                        // rest of the canvas is still delivered.
                        warn!(
                            dst_x = region.dst_x,
                            dst_y = region.dst_y,
                            "Monitor grab failed: {e}"
                        );
                        last_error = Some(e);
                    }
                }
            }
            match (grabbed, last_error) {
                (0, Some(e)) => Err(e),
                _ => Ok(canvas),
            }
        }
    }

    impl Drop for X11Capturer {
        fn drop(&mut self) {
            let _ = shm::detach(&self.conn, self.shm_seg);
            let _ = self.conn.flush();
            unsafe {
                libc::shmdt(self.shm_ptr as *const libc::c_void);
            }
            debug!("SHM capture segment detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(index: usize, x: i32, y: i32, width: u32, height: u32) -> Monitor {
        Monitor {
            index,
            name: format!("Monitor {}", index + 1),
            x,
            y,
            width,
            height,
            primary: index == 0,
        }
    }

    #[test]
    fn virtual_bounds_union_of_side_by_side_monitors() {
        let set = MonitorSet::from_monitors(vec![
            monitor(0, 0, 0, 1920, 1080),
            monitor(1, 1920, 0, 1920, 1080),
        ]);
        assert_eq!(set.virtual_x, 0);
        assert_eq!(set.virtual_y, 0);
        assert_eq!(set.virtual_width, 3840);
        assert_eq!(set.virtual_height, 1080);
    }

    #[test]
    fn virtual_bounds_handle_negative_origins() {
        let set = MonitorSet::from_monitors(vec![
            monitor(0, 0, 0, 2560, 1440),
            monitor(1, -1920, 200, 1920, 1080),
        ]);
        assert_eq!(set.virtual_x, -1920);
        assert_eq!(set.virtual_y, 0);
        assert_eq!(set.virtual_width, 4480);
        assert_eq!(set.virtual_height, 1440);
    }

    #[test]
    fn empty_monitor_set_has_zero_bounds() {
        let set = MonitorSet::from_monitors(vec![]);
        assert_eq!(set.virtual_width, 0);
        assert!(!set.contains(MonitorSelection::Monitor(0)));
        assert!(!set.contains(MonitorSelection::VirtualDesktop));
    }

    #[test]
    fn selection_from_operator_index() {
        assert_eq!(
            MonitorSelection::from_index(-1),
            Some(MonitorSelection::VirtualDesktop)
        );
        assert_eq!(
            MonitorSelection::from_index(1),
            Some(MonitorSelection::Monitor(1))
        );
        assert_eq!(MonitorSelection::from_index(-2), None);
    }

    #[test]
    fn selection_range_check() {
        let set = MonitorSet::from_monitors(vec![monitor(0, 0, 0, 1920, 1080)]);
        assert!(set.contains(MonitorSelection::Monitor(0)));
        assert!(!set.contains(MonitorSelection::Monitor(1)));
        assert!(set.contains(MonitorSelection::VirtualDesktop));
    }

    #[test]
    fn plan_for_single_monitor_is_origin_anchored() {
        let set = MonitorSet::from_monitors(vec![
            monitor(0, 0, 0, 1920, 1080),
            monitor(1, 1920, 0, 2560, 1440),
        ]);
        let (w, h, regions) = capture_plan(MonitorSelection::Monitor(1), &set);
        assert_eq!((w, h), (2560, 1440));
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].src_x, 1920);
        assert_eq!(regions[0].dst_x, 0);
        assert_eq!(regions[0].dst_y, 0);
    }

    #[test]
    fn plan_for_virtual_desktop_offsets_by_min_origin() {
        let set = MonitorSet::from_monitors(vec![
            monitor(0, 0, 0, 1920, 1080),
            monitor(1, -1920, 0, 1920, 1080),
        ]);
        let (w, h, regions) = capture_plan(MonitorSelection::VirtualDesktop, &set);
        assert_eq!((w, h), (3840, 1080));
        // Monitor 0 at x=0 lands at dst_x = 0 − (−1920) = 1920.
        assert_eq!(regions[0].dst_x, 1920);
        // Monitor 1 at x=−1920 lands at dst_x = 0.
        assert_eq!(regions[1].dst_x, 0);
    }

    #[test]
    fn queue_is_bounded_and_drops_newest() {
        let (tx, mut rx) = mpsc::channel::<Frame>(FRAME_QUEUE_DEPTH);
        let dropped = AtomicU64::new(0);

        for i in 0..100u32 {
            let mut frame = Frame::black(2, 2);
            frame.data[0] = i as u8;
            assert!(enqueue_frame(&tx, frame, &dropped));
        }

        // Only the first two frames survived; the other 98 were dropped.
        assert_eq!(dropped.load(Ordering::Relaxed), 98);
        assert_eq!(rx.try_recv().unwrap().data[0], 0);
        assert_eq!(rx.try_recv().unwrap().data[0], 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn enqueue_reports_closed_consumer() {
        let (tx, rx) = mpsc::channel::<Frame>(FRAME_QUEUE_DEPTH);
        drop(rx);
        let dropped = AtomicU64::new(0);
        assert!(!enqueue_frame(&tx, Frame::black(1, 1), &dropped));
    }

    #[test]
    fn source_rejects_double_start() {
        let capture = ScreenCapture::new(":99", 30);
        capture.running.store(true, Ordering::SeqCst);
        assert!(matches!(capture.start(), Err(AgentError::State(_))));
    }

    #[test]
    fn set_monitor_rejects_out_of_range_and_preserves_selection() {
        let capture = ScreenCapture::new(":99", 30);
        {
            let mut state = capture.state.lock().unwrap();
            state.monitors = MonitorSet::from_monitors(vec![monitor(0, 0, 0, 1920, 1080)]);
        }
        let before = capture.selection();
        assert!(matches!(
            capture.set_monitor(MonitorSelection::Monitor(5)),
            Err(AgentError::State(_))
        ));
        assert_eq!(capture.selection(), before);
    }

    #[test]
    fn set_monitor_is_idempotent_when_stopped() {
        let capture = ScreenCapture::new(":99", 30);
        {
            let mut state = capture.state.lock().unwrap();
            state.monitors = MonitorSet::from_monitors(vec![
                monitor(0, 0, 0, 1920, 1080),
                monitor(1, 1920, 0, 1920, 1080),
            ]);
        }
        capture.set_monitor(MonitorSelection::Monitor(1)).unwrap();
        capture.set_monitor(MonitorSelection::Monitor(1)).unwrap();
        assert_eq!(capture.selection(), MonitorSelection::Monitor(1));
    }

    #[test]
    fn stop_is_safe_to_call_twice() {
        let capture = ScreenCapture::new(":99", 30);
        capture.stop();
        capture.stop();
    }
}
