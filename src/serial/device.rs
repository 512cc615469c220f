//! Serial device abstraction.
//!
//! One struct, four transports. The original inheritance lattice collapses
//! into [`DeviceKind`]; behavior differences live in small per-kind matches.
//! File descriptor lifecycle is explicit: a device starts [`FdState::Unopened`],
//! an explicit `close()` moves it to [`FdState::Closed`], and only
//! `Open` holds a descriptor. A device that is working but momentarily
//! without a descriptor (dongle reset) sets `resetting` instead.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::debug;
use nix::sys::termios::{
    self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
};
use thiserror::Error;

use super::manager::ManagerInner;
use crate::util::hex::encode_hex;

/// Result of trying to open a byte source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    AccessOk,
    /// The path does not exist or cannot be opened.
    NotThere,
    /// Another process holds the exclusive advisory lock.
    NotSameGroup,
}

/// Fatal open failures, raised only in strict mode.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("could not open {device} with {baud} baud: {reason}")]
    OpenFailed {
        device: String,
        baud: u32,
        reason: String,
    },

    #[error("device {0} is already in use and locked")]
    Locked(String),

    #[error("could not start subprocess {0}: {1}")]
    SpawnFailed(String, String),

    #[error("could not open file {0}: {1}")]
    FileFailed(String, String),
}

/// Parity configuration for TTY sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// The enumerated baud rates a TTY source accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
    Baud300 = 300,
    Baud600 = 600,
    Baud1200 = 1200,
    Baud2400 = 2400,
    Baud4800 = 4800,
    Baud9600 = 9600,
    Baud19200 = 19200,
    Baud38400 = 38400,
    Baud57600 = 57600,
    Baud115200 = 115200,
}

impl BaudRate {
    pub fn from_u32(value: u32) -> Option<BaudRate> {
        match value {
            300 => Some(BaudRate::Baud300),
            600 => Some(BaudRate::Baud600),
            1200 => Some(BaudRate::Baud1200),
            2400 => Some(BaudRate::Baud2400),
            4800 => Some(BaudRate::Baud4800),
            9600 => Some(BaudRate::Baud9600),
            19200 => Some(BaudRate::Baud19200),
            38400 => Some(BaudRate::Baud38400),
            57600 => Some(BaudRate::Baud57600),
            115200 => Some(BaudRate::Baud115200),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    fn to_termios(self) -> termios::BaudRate {
        match self {
            BaudRate::Baud300 => termios::BaudRate::B300,
            BaudRate::Baud600 => termios::BaudRate::B600,
            BaudRate::Baud1200 => termios::BaudRate::B1200,
            BaudRate::Baud2400 => termios::BaudRate::B2400,
            BaudRate::Baud4800 => termios::BaudRate::B4800,
            BaudRate::Baud9600 => termios::BaudRate::B9600,
            BaudRate::Baud19200 => termios::BaudRate::B19200,
            BaudRate::Baud38400 => termios::BaudRate::B38400,
            BaudRate::Baud57600 => termios::BaudRate::B57600,
            BaudRate::Baud115200 => termios::BaudRate::B115200,
        }
    }
}

/// Transport behind a serial device.
#[derive(Debug)]
pub enum DeviceKind {
    Tty {
        path: String,
        baud: BaudRate,
        parity: Parity,
    },
    Subprocess {
        identifier: String,
        program: String,
        args: Vec<String>,
        envs: Vec<(String, String)>,
    },
    /// A regular file, or stdin for the pseudo path "stdin".
    File { path: String },
    Simulator,
}

#[derive(Debug)]
enum FdState {
    Unopened,
    Closed,
    Open(OwnedFd),
}

struct DeviceState {
    fd: FdState,
    resetting: bool,
    no_callbacks: bool,
    child: Option<Child>,
    sim_data: Vec<u8>,
}

type OnData = Arc<dyn Fn() + Send + Sync>;
type OnDisappear = Box<dyn FnOnce() + Send>;

/// A byte source managed by the event loop.
pub struct SerialDevice {
    kind: DeviceKind,
    purpose: String,
    state: Mutex<DeviceState>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    on_data: Mutex<Option<OnData>>,
    on_disappear: Mutex<Option<OnDisappear>>,
    manager: Mutex<Weak<ManagerInner>>,
}

impl SerialDevice {
    pub(crate) fn new(kind: DeviceKind, purpose: &str) -> SerialDevice {
        SerialDevice {
            kind,
            purpose: purpose.to_string(),
            state: Mutex::new(DeviceState {
                fd: FdState::Unopened,
                resetting: false,
                no_callbacks: false,
                child: None,
                sim_data: Vec::new(),
            }),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            on_data: Mutex::new(None),
            on_disappear: Mutex::new(None),
            manager: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn attach_manager(&self, manager: &Arc<ManagerInner>) {
        *self.manager.lock().unwrap() = Arc::downgrade(manager);
    }

    /// The path or alias identifying this source.
    pub fn device(&self) -> String {
        match &self.kind {
            DeviceKind::Tty { path, .. } => path.clone(),
            DeviceKind::Subprocess { identifier, .. } => identifier.clone(),
            DeviceKind::File { path } => path.clone(),
            DeviceKind::Simulator => "simulator".to_string(),
        }
    }

    /// Opens the underlying transport. Idempotent: an already open device
    /// reports `AccessOk`. With `strict` any failure is an error instead of
    /// a soft `AccessCheck`.
    pub fn open(&self, strict: bool) -> Result<AccessCheck, DeviceError> {
        if matches!(self.state.lock().unwrap().fd, FdState::Open(_)) {
            return Ok(AccessCheck::AccessOk);
        }

        match &self.kind {
            DeviceKind::Tty { path, baud, parity } => self.open_tty(path, *baud, *parity, strict),
            DeviceKind::Subprocess {
                identifier,
                program,
                args,
                envs,
            } => self.open_subprocess(identifier, program, args, envs, strict),
            DeviceKind::File { path } => self.open_file(path, strict),
            DeviceKind::Simulator => {
                debug!("(serial) simulator opened ({})", self.purpose);
                Ok(AccessCheck::AccessOk)
            }
        }
    }

    fn open_tty(
        &self,
        path: &str,
        baud: BaudRate,
        parity: Parity,
        strict: bool,
    ) -> Result<AccessCheck, DeviceError> {
        if !character_device_exists(path) {
            if strict {
                return Err(DeviceError::OpenFailed {
                    device: path.to_string(),
                    baud: baud.as_u32(),
                    reason: "no such character device".to_string(),
                });
            }
            return Ok(AccessCheck::NotThere);
        }

        match open_serial_tty(path, baud, parity) {
            Ok(fd) => {
                debug!(
                    "(serialtty) opened {} fd {} ({})",
                    path,
                    fd.as_raw_fd(),
                    self.purpose
                );
                self.state.lock().unwrap().fd = FdState::Open(fd);
                self.tickle_manager();
                Ok(AccessCheck::AccessOk)
            }
            Err(TtyOpenError::Locked) => {
                if strict {
                    Err(DeviceError::Locked(path.to_string()))
                } else {
                    Ok(AccessCheck::NotSameGroup)
                }
            }
            Err(TtyOpenError::Failed(reason)) => {
                if strict {
                    Err(DeviceError::OpenFailed {
                        device: path.to_string(),
                        baud: baud.as_u32(),
                        reason,
                    })
                } else {
                    Ok(AccessCheck::NotThere)
                }
            }
        }
    }

    fn open_subprocess(
        &self,
        identifier: &str,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
        strict: bool,
    ) -> Result<AccessCheck, DeviceError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for (k, v) in envs {
            cmd.env(k, v);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if strict {
                    return Err(DeviceError::SpawnFailed(program.to_string(), e.to_string()));
                }
                return Ok(AccessCheck::NotThere);
            }
        };

        let stdout = child.stdout.take().expect("stdout was piped");
        let fd: OwnedFd = stdout.into();
        set_nonblocking(fd.as_raw_fd());

        debug!(
            "(serialcmd) opened {} pid {} fd {} ({})",
            identifier,
            child.id(),
            fd.as_raw_fd(),
            self.purpose
        );

        let mut st = self.state.lock().unwrap();
        st.fd = FdState::Open(fd);
        st.child = Some(child);
        drop(st);
        self.tickle_manager();
        Ok(AccessCheck::AccessOk)
    }

    fn open_file(&self, path: &str, strict: bool) -> Result<AccessCheck, DeviceError> {
        let fd = if path == "stdin" {
            set_nonblocking(0);
            let raw = unsafe { libc::dup(0) };
            if raw == -1 {
                let e = std::io::Error::last_os_error();
                if strict {
                    return Err(DeviceError::FileFailed(path.to_string(), e.to_string()));
                }
                return Ok(AccessCheck::NotThere);
            }
            unsafe { OwnedFd::from_raw_fd(raw) }
        } else {
            match OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => file.into(),
                Err(e) => {
                    if strict {
                        return Err(DeviceError::FileFailed(path.to_string(), e.to_string()));
                    }
                    return Ok(AccessCheck::NotThere);
                }
            }
        };

        debug!("(serialfile) reading from {} ({})", path, self.purpose);
        self.state.lock().unwrap().fd = FdState::Open(fd);
        self.tickle_manager();
        Ok(AccessCheck::AccessOk)
    }

    /// Returns all currently available bytes without blocking.
    ///
    /// EOF on a file, stdin or a finished subprocess closes the device, as
    /// does a stale descriptor. EINTR is retried, EAGAIN ends the batch.
    pub fn receive(&self) -> Vec<u8> {
        let _guard = self.read_lock.lock().unwrap();

        if matches!(self.kind, DeviceKind::Simulator) {
            let mut st = self.state.lock().unwrap();
            return std::mem::take(&mut st.sim_data);
        }

        let Some(fd) = self.raw_fd() else {
            return Vec::new();
        };

        let mut data = Vec::new();
        let mut close_me = false;
        let mut chunk = [0u8; 1024];

        loop {
            let nr = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), chunk.len()) };
            if nr > 0 {
                data.extend_from_slice(&chunk[..nr as usize]);
                continue;
            }
            if nr == 0 {
                // End of stream: terminal for files, stdin and subprocesses.
                if self.is_eof_terminal() {
                    debug!("(serial) no more data on fd={fd}");
                    close_me = true;
                }
                break;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break,
                Some(libc::EBADF) => {
                    debug!("(serial) got EBADF for fd={fd}, closing it");
                    close_me = true;
                    break;
                }
                _ => break,
            }
        }

        if log::log_enabled!(log::Level::Debug) && !data.is_empty() {
            debug!("(serial) received binary \"{}\"", encode_hex(&data));
        }

        drop(_guard);
        if close_me {
            self.close();
        }

        data
    }

    /// Sends bytes. Read-only sources silently report success; a TTY writes
    /// everything, retrying EINTR.
    pub fn send(&self, data: &[u8]) -> bool {
        if self.readonly() {
            return true;
        }
        if data.is_empty() {
            return true;
        }

        let _guard = self.write_lock.lock().unwrap();
        let Some(fd) = self.raw_fd() else {
            return false;
        };

        let mut written = 0usize;
        while written < data.len() {
            let nw = unsafe {
                libc::write(
                    fd,
                    data[written..].as_ptr().cast(),
                    data.len() - written,
                )
            };
            if nw >= 0 {
                written += nw as usize;
                continue;
            }
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            debug!(
                "(serial {}) failed to send \"{}\"",
                self.device(),
                encode_hex(data)
            );
            return false;
        }

        debug!("(serial {}) sent \"{}\"", self.device(), encode_hex(data));
        self.tickle_manager();
        true
    }

    /// Releases the lock and descriptor, fires `on_disappear` once and
    /// tickles the event loop. Safe to call repeatedly.
    pub fn close(&self) {
        if matches!(self.kind, DeviceKind::Simulator) {
            return;
        }

        let resetting;
        {
            let mut st = self.state.lock().unwrap();
            match std::mem::replace(&mut st.fd, FdState::Closed) {
                FdState::Open(fd) => {
                    if matches!(self.kind, DeviceKind::Tty { .. }) {
                        unsafe {
                            libc::flock(fd.as_raw_fd(), libc::LOCK_UN);
                        }
                    }
                    drop(fd);
                }
                FdState::Closed => return,
                FdState::Unopened => {}
            }

            if let Some(mut child) = st.child.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
            resetting = st.resetting;
        }

        if !resetting {
            if let Some(cb) = self.on_disappear.lock().unwrap().take() {
                cb();
            }
        }
        self.tickle_manager();
        debug!("(serial) closed {} ({})", self.device(), self.purpose);
    }

    /// Simulator only: store bytes and trigger the data callback once.
    pub fn fill(&self, data: &[u8]) {
        if !matches!(self.kind, DeviceKind::Simulator) {
            return;
        }
        self.state
            .lock()
            .unwrap()
            .sim_data
            .extend_from_slice(data);
        self.call_on_data();
    }

    pub fn opened(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.resetting || !matches!(st.fd, FdState::Unopened)
    }

    pub fn is_closed(&self) -> bool {
        let st = self.state.lock().unwrap();
        matches!(st.fd, FdState::Closed) && !st.resetting
    }

    pub fn resetting(&self) -> bool {
        self.state.lock().unwrap().resetting
    }

    pub fn readonly(&self) -> bool {
        !matches!(self.kind, DeviceKind::Tty { .. })
    }

    pub fn skipping_callbacks(&self) -> bool {
        self.state.lock().unwrap().no_callbacks
    }

    /// Mutes this device in the readiness loop.
    pub fn disable_callbacks(&self) {
        self.state.lock().unwrap().no_callbacks = true;
    }

    pub fn enable_callbacks(&self) {
        self.state.lock().unwrap().no_callbacks = false;
    }

    pub fn reset_initiated(&self) {
        debug!("(serial) initiate reset for {}", self.device());
        self.state.lock().unwrap().resetting = true;
    }

    pub fn reset_completed(&self) {
        debug!("(serial) reset completed for {}", self.device());
        self.state.lock().unwrap().resetting = false;
    }

    /// The raw descriptor to poll, when one exists.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.state.lock().unwrap().fd {
            FdState::Open(fd) => Some(fd.as_raw_fd()),
            _ => None,
        }
    }

    /// Liveness per transport. A resetting device counts as working.
    pub fn working(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.resetting {
            return true;
        }
        let fd = match &st.fd {
            FdState::Open(fd) => fd.as_raw_fd(),
            _ => return false,
        };

        match &self.kind {
            DeviceKind::Tty { path, .. } => {
                let ok = character_device_exists(path);
                if !ok {
                    debug!("(serial) device {path} is gone");
                }
                ok
            }
            DeviceKind::Subprocess { .. } => {
                // Buffered output keeps the source alive even after the
                // child has exited.
                match queued_bytes(fd) {
                    Some(n) if n > 0 => true,
                    Some(_) => match st.child.as_mut() {
                        Some(child) => matches!(child.try_wait(), Ok(None)),
                        None => false,
                    },
                    None => false,
                }
            }
            DeviceKind::File { .. } => queued_bytes(fd).is_some(),
            DeviceKind::Simulator => false,
        }
    }

    /// Cheap peek at the OS queue length.
    pub fn check_if_data_is_pending(&self) -> bool {
        if matches!(self.kind, DeviceKind::Simulator) {
            return !self.state.lock().unwrap().sim_data.is_empty();
        }
        if !self.opened() || !self.working() {
            return false;
        }
        match self.raw_fd() {
            Some(fd) => matches!(queued_bytes(fd), Some(n) if n > 0),
            None => false,
        }
    }

    pub(crate) fn set_on_data(&self, cb: OnData) {
        *self.on_data.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_on_disappear(&self, cb: OnDisappear) {
        *self.on_disappear.lock().unwrap() = Some(cb);
    }

    pub(crate) fn call_on_data(&self) {
        let cb = self.on_data.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    pub(crate) fn invalidate_manager(&self) {
        *self.manager.lock().unwrap() = Weak::new();
    }

    fn is_eof_terminal(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::File { .. } | DeviceKind::Subprocess { .. }
        )
    }

    fn tickle_manager(&self) {
        if let Some(manager) = self.manager.lock().unwrap().upgrade() {
            manager.tickle_event_loop();
        }
    }
}

impl std::fmt::Debug for SerialDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialDevice")
            .field("kind", &self.kind)
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

enum TtyOpenError {
    Locked,
    Failed(String),
}

/// Opens and configures a TTY: exclusive advisory lock, raw 8-bit mode with
/// the configured parity, no flow control, VMIN=0/VTIME=0. A transient open
/// failure is retried once after a second.
fn open_serial_tty(path: &str, baud: BaudRate, parity: Parity) -> Result<OwnedFd, TtyOpenError> {
    let open_once = || {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
    };

    let file = match open_once() {
        Ok(f) => f,
        Err(_) => {
            std::thread::sleep(Duration::from_secs(1));
            open_once().map_err(|e| TtyOpenError::Failed(e.to_string()))?
        }
    };
    let fd: OwnedFd = file.into();

    let rc = unsafe { libc::flock(fd.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == -1 {
        // Another ingestion process already owns this dongle.
        return Err(TtyOpenError::Locked);
    }

    let mut tios = termios::tcgetattr(&fd).map_err(|e| TtyOpenError::Failed(e.to_string()))?;

    tios.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;
    tios.control_flags &= !ControlFlags::CSIZE;
    tios.control_flags |= ControlFlags::CS8;
    tios.control_flags &= !ControlFlags::CSTOPB;
    match parity {
        Parity::None => {
            tios.control_flags &= !ControlFlags::PARENB;
        }
        Parity::Even => {
            tios.control_flags |= ControlFlags::PARENB;
            tios.control_flags &= !ControlFlags::PARODD;
        }
        Parity::Odd => {
            tios.control_flags |= ControlFlags::PARENB;
            tios.control_flags |= ControlFlags::PARODD;
        }
    }

    tios.local_flags &=
        !(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ISIG);
    tios.input_flags &=
        !(InputFlags::INPCK | InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);
    tios.output_flags &= !OutputFlags::OPOST;
    tios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::cfsetispeed(&mut tios, baud.to_termios())
        .map_err(|e| TtyOpenError::Failed(e.to_string()))?;
    termios::cfsetospeed(&mut tios, baud.to_termios())
        .map_err(|e| TtyOpenError::Failed(e.to_string()))?;
    termios::tcsetattr(&fd, SetArg::TCSANOW, &tios)
        .map_err(|e| TtyOpenError::Failed(e.to_string()))?;

    Ok(fd)
}

fn character_device_exists(path: &str) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_char_device())
        .unwrap_or(false)
}

/// FIONREAD: bytes waiting in the kernel queue, `None` on a bad descriptor.
fn queued_bytes(fd: RawFd) -> Option<i32> {
    let mut available: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
    if rc == -1 {
        None
    } else {
        Some(available)
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags != -1 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}
