//! Event loop and timer wheel.
//!
//! Two long-lived worker threads: the readiness loop polls every eligible
//! device descriptor with a one second ceiling, the timer loop ticks once a
//! second. Both poll `running` cooperatively. A self-pipe "tickle" unblocks
//! the readiness loop whenever the device list or a descriptor changes, and
//! `stop()` tickles everything so shutdown completes within one tick.
//!
//! Lock discipline: the device list mutex and timer mutex are leaf locks;
//! callbacks (`on_data`, `on_disappear`, timer handlers) always run with no
//! manager lock held.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::device::{BaudRate, DeviceKind, Parity, SerialDevice};

/// Poll ceiling and timer tick.
const TICK: Duration = Duration::from_secs(1);

/// Handle for cancelling a regular callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(usize);

struct Timer {
    id: usize,
    name: String,
    period: Duration,
    last_call: Instant,
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl Timer {
    fn is_time(&self, now: Instant) -> bool {
        self.last_call + self.period <= now
    }
}

/// Shared manager state; devices hold a `Weak` back-reference to tickle the
/// readiness loop on state changes.
pub(crate) struct ManagerInner {
    running: AtomicBool,
    expect_devices_to_work: AtomicBool,
    start_time: Instant,
    exit_after: Option<Duration>,
    devices: Mutex<Vec<Arc<SerialDevice>>>,
    timers: Mutex<Vec<Timer>>,
    next_timer_id: AtomicUsize,
    tickle_read: OwnedFd,
    tickle_write: OwnedFd,
    /// Gate released by `start_event_loop()`.
    started: (Mutex<bool>, Condvar),
    /// Wakes the timer loop and `wait_for_stop` out of their sleeps.
    sleeper: (Mutex<()>, Condvar),
}

impl ManagerInner {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Writes one byte into the self-pipe so a blocked poll returns.
    pub(crate) fn tickle_event_loop(&self) {
        let buf = [0u8; 1];
        unsafe {
            libc::write(self.tickle_write.as_raw_fd(), buf.as_ptr().cast(), 1);
        }
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("(serial) stopping manager");
            self.tickle_event_loop();
            self.sleeper.1.notify_all();
        }
    }
}

/// Owns the byte sources and the two worker threads.
pub struct SerialManager {
    inner: Arc<ManagerInner>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialManager {
    /// Creates the manager and starts both workers. The readiness loop stays
    /// parked until [`SerialManager::start_event_loop`] releases it, so
    /// devices can be configured without racing the first poll round.
    pub fn new(exit_after: Option<Duration>) -> SerialManager {
        let (tickle_read, tickle_write) = nix::unistd::pipe().expect("self-pipe");
        set_nonblocking(tickle_read.as_raw_fd());
        set_nonblocking(tickle_write.as_raw_fd());

        let inner = Arc::new(ManagerInner {
            running: AtomicBool::new(true),
            expect_devices_to_work: AtomicBool::new(false),
            start_time: Instant::now(),
            exit_after,
            devices: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            next_timer_id: AtomicUsize::new(0),
            tickle_read,
            tickle_write,
            started: (Mutex::new(false), Condvar::new()),
            sleeper: (Mutex::new(()), Condvar::new()),
        });

        let event_inner = inner.clone();
        let event_thread = std::thread::Builder::new()
            .name("wmbusd-event".to_string())
            .spawn(move || event_loop(&event_inner))
            .expect("spawn event loop");

        let timer_inner = inner.clone();
        let timer_thread = std::thread::Builder::new()
            .name("wmbusd-timer".to_string())
            .spawn(move || timer_loop(&timer_inner))
            .expect("spawn timer loop");

        SerialManager {
            inner,
            event_thread: Mutex::new(Some(event_thread)),
            timer_thread: Mutex::new(Some(timer_thread)),
        }
    }

    /// Releases the readiness loop.
    pub fn start_event_loop(&self) {
        let (lock, cvar) = &self.inner.started;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn create_tty_device(
        &self,
        path: &str,
        baud: BaudRate,
        parity: Parity,
        purpose: &str,
    ) -> Arc<SerialDevice> {
        self.add_device(SerialDevice::new(
            DeviceKind::Tty {
                path: path.to_string(),
                baud,
                parity,
            },
            purpose,
        ))
    }

    pub fn create_subprocess_device(
        &self,
        identifier: &str,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
        purpose: &str,
    ) -> Arc<SerialDevice> {
        self.add_device(SerialDevice::new(
            DeviceKind::Subprocess {
                identifier: identifier.to_string(),
                program: program.to_string(),
                args: args.to_vec(),
                envs: envs.to_vec(),
            },
            purpose,
        ))
    }

    /// A regular file, or stdin for the pseudo path "stdin".
    pub fn create_file_device(&self, path: &str, purpose: &str) -> Arc<SerialDevice> {
        self.add_device(SerialDevice::new(
            DeviceKind::File {
                path: path.to_string(),
            },
            purpose,
        ))
    }

    pub fn create_simulator_device(&self) -> Arc<SerialDevice> {
        self.add_device(SerialDevice::new(DeviceKind::Simulator, "simulator"))
    }

    fn add_device(&self, device: SerialDevice) -> Arc<SerialDevice> {
        let device = Arc::new(device);
        device.attach_manager(&self.inner);
        self.inner.devices.lock().unwrap().push(device.clone());
        self.inner.tickle_event_loop();
        device
    }

    /// Invokes `cb` whenever data is ready on the device.
    pub fn listen_to(&self, device: &Arc<SerialDevice>, cb: impl Fn() + Send + Sync + 'static) {
        device.set_on_data(Arc::new(cb));
    }

    /// Invokes `cb` once when the device disappears.
    pub fn on_disappear(&self, device: &Arc<SerialDevice>, cb: impl FnOnce() + Send + 'static) {
        device.set_on_disappear(Box::new(cb));
    }

    /// After detection has finished: losing the last working device now
    /// stops the manager instead of being tolerated.
    pub fn expect_devices_to_work(&self) {
        debug!("(serial) expecting devices to work");
        self.inner
            .expect_devices_to_work
            .store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Sets `running := false` and tickles every loop.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Blocks the calling thread until the manager stops or runs out of
    /// devices, then closes everything and joins both workers.
    pub fn wait_for_stop(&self) {
        debug!("(serial) waiting for stop");

        while self.inner.is_running() {
            if self.inner.devices.lock().unwrap().is_empty() {
                break;
            }
            let (lock, cvar) = &self.inner.sleeper;
            let guard = lock.lock().unwrap();
            let _ = cvar.wait_timeout(guard, TICK).unwrap();
        }

        self.close_all_do_not_remove();
        self.inner.stop();
        self.join_workers();
    }

    /// Registers a callback run every `period`. Returns its cancellation id.
    pub fn start_regular_callback(
        &self,
        name: &str,
        period: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> TimerId {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::SeqCst);
        self.inner.timers.lock().unwrap().push(Timer {
            id,
            name: name.to_string(),
            period,
            last_call: Instant::now(),
            callback: Arc::new(callback),
        });
        debug!(
            "(serial) registered regular callback {name}({id}) every {}s",
            period.as_secs()
        );
        TimerId(id)
    }

    pub fn stop_regular_callback(&self, id: TimerId) {
        debug!("(serial) stopping regular callback {}", id.0);
        self.inner.timers.lock().unwrap().retain(|t| t.id != id.0);
    }

    /// Finds a device by its path or alias.
    pub fn lookup(&self, device: &str) -> Option<Arc<SerialDevice>> {
        self.inner
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.device() == device)
            .cloned()
    }

    /// Removes a non-working device by path. Returns false when the device
    /// is still working or unknown.
    pub fn remove_non_working(&self, device: &str) -> bool {
        let mut devices = self.inner.devices.lock().unwrap();
        let before = devices.len();
        devices.retain(|d| !(d.opened() && !d.working() && d.device() == device));
        before != devices.len()
    }

    fn close_all_do_not_remove(&self) {
        let snapshot: Vec<_> = self.inner.devices.lock().unwrap().clone();
        if snapshot.is_empty() {
            return;
        }
        debug!("(serial) closing {} devices", snapshot.len());
        for device in snapshot {
            device.close();
        }
    }

    fn join_workers(&self) {
        if let Some(handle) = self.event_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.timer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SerialManager {
    fn drop(&mut self) {
        self.inner.stop();
        // Release a never-started readiness loop so the join cannot hang.
        self.start_event_loop();
        self.join_workers();
        // Ownership flows manager -> devices; break the back-references
        // before the devices go away.
        let devices: Vec<_> = {
            let mut guard = self.inner.devices.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for device in &devices {
            device.invalidate_manager();
            device.close();
        }
    }
}

fn event_loop(inner: &Arc<ManagerInner>) {
    // Park until the configuration phase releases the loop.
    {
        let (lock, cvar) = &inner.started;
        let mut started = lock.lock().unwrap();
        while !*started && inner.is_running() {
            started = cvar.wait(started).unwrap();
        }
    }

    while inner.is_running() {
        let mut all_working = true;
        let mut pollable: Vec<(Arc<SerialDevice>, i32)> = Vec::new();
        {
            let devices = inner.devices.lock().unwrap();
            for d in devices.iter() {
                if d.opened() && d.working() && !d.skipping_callbacks() && !d.resetting() {
                    if let Some(fd) = d.raw_fd() {
                        pollable.push((d.clone(), fd));
                    }
                }
                if d.opened() && !d.working() {
                    all_working = false;
                }
            }
        }

        if !all_working && inner.expect_devices_to_work.load(Ordering::SeqCst) {
            debug!("(serial) not all devices working, emergency exit");
            inner.stop();
            break;
        }

        // Readiness wait, ceiling one second, self-pipe first.
        let mut pollfds: Vec<PollFd> = Vec::with_capacity(pollable.len() + 1);
        pollfds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(inner.tickle_read.as_raw_fd()) },
            PollFlags::POLLIN,
        ));
        for (_, fd) in &pollable {
            trace!("(serial) poll read on fd {fd}");
            pollfds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(*fd) },
                PollFlags::POLLIN,
            ));
        }

        let activity = match poll(&mut pollfds, PollTimeout::from(1000u16)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => {
                debug!("(serial) event thread interrupted");
                continue;
            }
            Err(e) => {
                warn!("(serial) internal error after poll: {e}");
                continue;
            }
        };

        if !inner.is_running() {
            break;
        }

        if activity > 0 {
            let mut to_be_notified = Vec::new();
            for (i, pollfd) in pollfds.iter().enumerate() {
                let revents = pollfd.revents().unwrap_or(PollFlags::empty());
                if revents.is_empty() {
                    continue;
                }
                if i == 0 {
                    drain_tickle_pipe(inner);
                } else if let Some((device, fd)) = pollable.get(i - 1) {
                    trace!("(serial) data available on fd {fd}");
                    to_be_notified.push(device.clone());
                }
            }
            drop(pollfds);

            // Callbacks run with no manager lock held.
            for device in to_be_notified {
                device.call_on_data();
            }
        }

        // Sweep: close what stopped working, then drop what is closed.
        let non_working: Vec<_> = {
            let devices = inner.devices.lock().unwrap();
            devices
                .iter()
                .filter(|d| d.opened() && !d.working() && !d.is_closed())
                .cloned()
                .collect()
        };
        for device in &non_working {
            debug!("(serial) closing non-working device {}", device.device());
            device.close();
        }
        remove_non_working_devices(inner);

        if !non_working.is_empty() && inner.expect_devices_to_work.load(Ordering::SeqCst) {
            debug!("(serial) non-working devices found, exiting");
            inner.stop();
            break;
        }
    }
    debug!("(serial) event loop stopped");
}

fn remove_non_working_devices(inner: &Arc<ManagerInner>) {
    let mut devices = inner.devices.lock().unwrap();
    devices.retain(|d| !(d.opened() && !d.working()));

    if devices.is_empty() && inner.expect_devices_to_work.load(Ordering::SeqCst) {
        debug!("(serial) no devices working, emergency exit");
        drop(devices);
        inner.stop();
    }
}

fn timer_loop(inner: &Arc<ManagerInner>) {
    while inner.is_running() {
        {
            let (lock, cvar) = &inner.sleeper;
            let guard = lock.lock().unwrap();
            let _ = cvar.wait_timeout(guard, TICK).unwrap();
        }
        if !inner.is_running() {
            break;
        }

        if let Some(limit) = inner.exit_after {
            let elapsed = inner.start_time.elapsed();
            if elapsed > limit {
                debug!("(serial) exit after {}s", elapsed.as_secs());
                inner.stop();
                break;
            }
        }

        execute_timer_callbacks(inner);
    }
    debug!("(serial) timer loop stopped");
}

fn execute_timer_callbacks(inner: &Arc<ManagerInner>) {
    let now = Instant::now();
    let to_be_called: Vec<(String, Arc<dyn Fn() + Send + Sync>)> = {
        let mut timers = inner.timers.lock().unwrap();
        timers
            .iter_mut()
            .filter(|t| t.is_time(now))
            .map(|t| {
                t.last_call = now;
                (t.name.clone(), t.callback.clone())
            })
            .collect()
    };

    for (name, callback) in to_be_called {
        trace!("(serial) invoking timer callback {name}");
        callback();
    }
}

fn drain_tickle_pipe(inner: &Arc<ManagerInner>) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe {
            libc::read(
                inner.tickle_read.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n <= 0 {
            break;
        }
    }
}

fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags != -1 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}
