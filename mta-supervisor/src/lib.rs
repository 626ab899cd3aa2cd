//! The process supervisor (spec §4.4): a single-threaded event-driven
//! controller holding a pidfile lock, enforcing per-service process caps
//! and restart throttling, and reconfiguring on SIGHUP via a self-pipe
//! (spec §9) rather than polling async-signal-unsafe flags.

pub mod config;

use std::{
    collections::HashMap,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::{Duration, Instant},
};

use fs2::FileExt;
use nix::{
    sys::{
        signal::{self, Signal},
        wait::{self, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

pub use config::{ServiceConfig, ServiceTable, Transport};

/// How recently a child must have been forked for its exit to count as
/// "abnormal and fast" and trip throttling (spec §4.4).
const DEFAULT_THROTTLE_TIME: Duration = Duration::from_secs(1);
/// Flat (non-doubling) throttle deadline once tripped: spec §4.4 and
/// SPEC_FULL's supplement from `master/master.c` both specify this is
/// *not* exponential, unlike the Queue Manager's dead-queue timer.
const DEFAULT_THROTTLE_DELAY: Duration = Duration::from_secs(60);
/// Watchdog tick: the event loop must be serviced within this long or the
/// process self-trips (spec §4.4: "every tick (e.g. 1000 s) it self-trips
/// if the event loop has not been serviced, causing abort").
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(1000);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("I/O error on pidfile ‘{1}’")]
    Pidfile(#[source] std::io::Error, PathBuf),
    #[error("another supervisor instance already holds the pidfile lock")]
    AlreadyRunning,
    #[error("configuration error")]
    Config(#[from] config::ConfigError),
    #[error("I/O error spawning service ‘{1}’")]
    Spawn(#[source] std::io::Error, String),
}

/// Per-service state machine (spec §4.4).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceState {
    /// Ready to accept; listening on its endpoint.
    Available,
    /// A child exited abnormally too fast; listener disarmed until the
    /// deadline.
    Throttled,
    /// Removed from config by a SIGHUP reload; no new children, existing
    /// ones signalled SIGTERM.
    Retired,
}

struct ServiceRuntime {
    state: ServiceState,
    throttle_deadline: Option<Instant>,
    /// pid -> time it was forked, to tell "exited abnormally fast" apart
    /// from a long-lived child finally cycling out.
    live_children: HashMap<u32, Instant>,
    total_proc_count: u64,
}

impl ServiceRuntime {
    fn new() -> ServiceRuntime {
        ServiceRuntime {
            state: ServiceState::Available,
            throttle_deadline: None,
            live_children: HashMap::new(),
            total_proc_count: 0,
        }
    }
}

pub struct Supervisor {
    table: RwLock<Arc<ServiceTable>>,
    runtime: Mutex<HashMap<String, ServiceRuntime>>,
    throttle_time: Duration,
    throttle_delay: Duration,
    _pidfile: std::fs::File,
}

impl Supervisor {
    /// Takes the pidfile advisory lock (spec §5: "advisory locks on the
    /// pidfile prevent two Supervisors from running") and loads the
    /// initial service table.
    pub fn start(config_path: &Path, pidfile_path: &Path) -> Result<Supervisor, SupervisorError> {
        let pidfile = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(pidfile_path)
            .map_err(|e| SupervisorError::Pidfile(e, pidfile_path.to_owned()))?;
        pidfile
            .try_lock_exclusive()
            .map_err(|_| SupervisorError::AlreadyRunning)?;

        let text = std::fs::read_to_string(config_path)
            .map_err(|e| SupervisorError::Pidfile(e, config_path.to_owned()))?;
        let table = ServiceTable::parse(&text)?;

        let mut runtime = HashMap::new();
        for name in table.services.keys() {
            runtime.insert(name.clone(), ServiceRuntime::new());
        }

        Ok(Supervisor {
            table: RwLock::new(Arc::new(table)),
            runtime: Mutex::new(runtime),
            throttle_time: DEFAULT_THROTTLE_TIME,
            throttle_delay: DEFAULT_THROTTLE_DELAY,
            _pidfile: pidfile,
        })
    }

    pub fn current_table(&self) -> Arc<ServiceTable> {
        self.table.read().clone()
    }

    /// SIGHUP (spec §4.4): re-reads the service table and swaps it in as
    /// one atomic snapshot; newly-absent services retire (existing
    /// children get SIGTERM, no new ones spawn); new/changed services
    /// start Available with a fresh runtime slot.
    pub fn reload(&self, config_path: &Path) -> Result<(), SupervisorError> {
        let text = std::fs::read_to_string(config_path)
            .map_err(|e| SupervisorError::Pidfile(e, config_path.to_owned()))?;
        let new_table = ServiceTable::parse(&text)?;

        let old_table = self.table.read().clone();
        let removed: Vec<String> = old_table.removed_since(&new_table).map(|s| s.to_owned()).collect();

        let mut runtime = self.runtime.lock();
        for name in &removed {
            if let Some(svc) = runtime.get_mut(name) {
                svc.state = ServiceState::Retired;
                for &pid in svc.live_children.keys() {
                    send_signal(pid, Signal::SIGTERM);
                }
                info!(service = %name, "service retired by SIGHUP, sent SIGTERM to its children");
            }
        }
        for name in new_table.services.keys() {
            runtime.entry(name.clone()).or_insert_with(ServiceRuntime::new);
            // A service that reappears (or was never retired) goes back to
            // Available: rearm its listener.
            if let Some(svc) = runtime.get_mut(name) {
                if svc.state == ServiceState::Retired {
                    svc.state = ServiceState::Available;
                }
            }
        }
        drop(runtime);

        *self.table.write() = Arc::new(new_table);
        info!("service table reloaded");
        Ok(())
    }

    /// Forks and execs one instance of `service_name`'s command, passing
    /// the accepted connection (or listener, for fifo/inet) on descriptor
    /// 3 -- a fixed descriptor, per spec §4.4. Respects the configured
    /// `max_proc` cap and refuses while Throttled or Retired.
    pub fn spawn_child(
        &self,
        service_name: &str,
        accepted_fd: std::os::unix::io::RawFd,
    ) -> Result<Option<u32>, SupervisorError> {
        let table = self.current_table();
        let Some(cfg) = table.services.get(service_name) else {
            return Ok(None);
        };

        let mut runtime = self.runtime.lock();
        let Some(svc) = runtime.get_mut(service_name) else {
            return Ok(None);
        };

        match svc.state {
            ServiceState::Retired => return Ok(None),
            ServiceState::Throttled => {
                if let Some(deadline) = svc.throttle_deadline {
                    if Instant::now() < deadline {
                        return Ok(None);
                    }
                }
                svc.state = ServiceState::Available;
                svc.throttle_deadline = None;
            }
            ServiceState::Available => {}
        }

        if svc.live_children.len() as u32 >= cfg.max_proc {
            return Ok(None);
        }

        let mut command = Command::new(&cfg.command);
        command.args(&cfg.args);
        command.env("MAIL_SERVICE_NAME", &cfg.name);
        unsafe {
            command.pre_exec(move || {
                // Duplicate the accepted connection onto the fixed
                // descriptor children read their work from (spec §4.4).
                if accepted_fd != 3 {
                    nix::unistd::dup2(accepted_fd, 3)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| SupervisorError::Spawn(e, service_name.to_owned()))?;
        let pid = child.id();
        svc.live_children.insert(pid, Instant::now());
        svc.total_proc_count += 1;
        // We intentionally don't `.wait()` here: reaping happens in
        // `on_sigchld`, driven by the supervisor's own event loop, not by
        // blocking this call on the child's lifetime.
        std::mem::forget(child);
        info!(service = %service_name, pid, "spawned child");
        Ok(Some(pid))
    }

    /// SIGCHLD (spec §4.4): reap every exited child, updating whichever
    /// service owns its pid. An abnormal exit within `throttle_time` of
    /// fork throttles the service; otherwise the live count is simply
    /// decremented.
    pub fn reap_children(&self) {
        loop {
            match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => self.on_child_exit(pid.as_raw() as u32, code == 0),
                Ok(WaitStatus::Signaled(pid, _, _)) => self.on_child_exit(pid.as_raw() as u32, false),
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
    }

    fn on_child_exit(&self, pid: u32, clean: bool) {
        let mut runtime = self.runtime.lock();
        for (name, svc) in runtime.iter_mut() {
            let Some(forked_at) = svc.live_children.remove(&pid) else {
                continue;
            };
            let fast = forked_at.elapsed() < self.throttle_time;
            if !clean && fast {
                svc.state = ServiceState::Throttled;
                svc.throttle_deadline = Some(Instant::now() + self.throttle_delay);
                warn!(service = %name, pid, "child exited abnormally within throttle window, service throttled");
            }
            return;
        }
    }

    /// SIGTERM (spec §4.4): propagate to all children of all services,
    /// then the caller exits.
    pub fn terminate_all(&self) {
        let runtime = self.runtime.lock();
        for (name, svc) in runtime.iter() {
            for &pid in svc.live_children.keys() {
                send_signal(pid, Signal::SIGTERM);
            }
            if !svc.live_children.is_empty() {
                info!(service = %name, count = svc.live_children.len(), "sent SIGTERM to service's children");
            }
        }
    }

    pub fn service_state(&self, name: &str) -> Option<ServiceState> {
        self.runtime.lock().get(name).map(|s| s.state)
    }

    pub fn live_child_count(&self, name: &str) -> usize {
        self.runtime.lock().get(name).map(|s| s.live_children.len()).unwrap_or(0)
    }
}

fn send_signal(pid: u32, signal: Signal) {
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), signal) {
        warn!(pid, signal = ?signal, error = %e, "failed to signal child");
    }
}

/// Installs the self-pipe (spec §9): SIGHUP/SIGCHLD/SIGTERM are delivered
/// as bytes on a `smol::channel`, so the cooperative event loop can treat
/// "a signal arrived" exactly like any other readable descriptor instead
/// of polling an async-signal-unsafe flag.
pub fn install_signal_self_pipe() -> std::io::Result<smol::channel::Receiver<RawSignal>> {
    let (tx, rx) = smol::channel::unbounded();
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGCHLD,
        signal_hook::consts::SIGTERM,
    ])?;
    std::thread::spawn(move || {
        for signal in signals.forever() {
            let mapped = match signal {
                s if s == signal_hook::consts::SIGHUP => RawSignal::Hup,
                s if s == signal_hook::consts::SIGCHLD => RawSignal::Chld,
                s if s == signal_hook::consts::SIGTERM => RawSignal::Term,
                _ => continue,
            };
            if tx.send_blocking(mapped).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RawSignal {
    Hup,
    Chld,
    Term,
}

/// The supervisor's main loop (spec §5: "single-threaded cooperative event
/// loop"). Dispatches signals from the self-pipe and self-trips the
/// watchdog (spec §4.4) if it is ever starved for longer than
/// [`WATCHDOG_PERIOD`].
pub async fn run_event_loop(
    supervisor: Arc<Supervisor>,
    config_path: PathBuf,
    signals: smol::channel::Receiver<RawSignal>,
    shutdown: smol::channel::Receiver<()>,
) {
    loop {
        let watchdog = smol::Timer::after(WATCHDOG_PERIOD);
        let tick = async {
            futures::select_biased! {
                sig = signals.recv().fuse() => Tick::Signal(sig.ok()),
                _ = shutdown.recv().fuse() => Tick::Shutdown,
                _ = futures::FutureExt::fuse(watchdog) => Tick::WatchdogExpired,
            }
        };
        use futures::FutureExt;
        match tick.await {
            Tick::Signal(Some(RawSignal::Hup)) => {
                if let Err(e) = supervisor.reload(&config_path) {
                    error!(error = %e, "failed to reload configuration on SIGHUP");
                }
            }
            Tick::Signal(Some(RawSignal::Chld)) => supervisor.reap_children(),
            Tick::Signal(Some(RawSignal::Term)) | Tick::Shutdown => {
                supervisor.terminate_all();
                return;
            }
            Tick::Signal(None) => return,
            Tick::WatchdogExpired => {
                error!("watchdog starved: event loop unresponsive, aborting");
                std::process::abort();
            }
        }
    }
}

enum Tick {
    Signal(Option<RawSignal>),
    Shutdown,
    WatchdogExpired,
}
