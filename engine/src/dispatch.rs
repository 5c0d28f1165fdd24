use crate::error::{BridgeError, Result};
use crate::hw::traits::{DescriptorSet, PollDescriptor, Readiness, StreamDirection};
use nix::errno::Errno;
use nix::libc;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{JoinHandle, ThreadId};
use tracing::{debug, error, warn};

pub const SCHEDULER_THREAD_NAME: &str = "pcmbridge-events";

pub type SourceId = u64;

/// Immutable record handed to a handler for each readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    pub source: SourceId,
    pub stream: StreamDirection,
    pub descriptor: PollDescriptor,
    /// The readiness this source watches for.
    pub interest: Readiness,
    /// Raw readiness reported by the OS; may be stale or coalesced.
    pub fired: Readiness,
    /// The OS also reported an error or hangup condition.
    pub error: bool,
}

/// What the scheduler does with a source after its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    /// Stop watching this source; the owner's later `cancel` is a no-op for it.
    Remove,
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, ctx: EventContext) -> Disposition;
}

struct Source {
    id: SourceId,
    stream: StreamDirection,
    descriptor: PollDescriptor,
    interest: Readiness,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct SchedulerState {
    sources: Vec<Source>,
    next_id: SourceId,
    running: Option<SourceId>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    idle: Condvar,
    wake_rx: File,
    wake_tx: File,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        if let Err(e) = (&self.wake_tx).write(&[1]) {
            if e.kind() != ErrorKind::WouldBlock {
                error!("event scheduler wake failed: {e}");
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0_u8; 64];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

fn nonblocking_pipe() -> Result<(File, File)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(BridgeError::Scheduler(format!("pipe failed: {}", Errno::last())));
    }
    let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&rx, &tx] {
        let raw = fd.as_raw_fd();
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0
            || unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
            || unsafe { libc::fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC) } < 0
        {
            return Err(BridgeError::Scheduler(format!("fcntl failed: {}", Errno::last())));
        }
    }
    Ok((File::from(rx), File::from(tx)))
}

/// One background thread that polls every registered source and runs their
/// handlers one at a time.
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("sources", &self.source_count())
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

fn registry() -> &'static Mutex<Weak<Scheduler>> {
    static REG: OnceLock<Mutex<Weak<Scheduler>>> = OnceLock::new();
    REG.get_or_init(|| Mutex::new(Weak::new()))
}

impl Scheduler {
    /// Process-wide instance, created on first use and torn down with its last user.
    pub fn shared() -> Result<Arc<Scheduler>> {
        let mut slot = registry().lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.upgrade() {
            return Ok(existing);
        }
        let created = Arc::new(Self::spawn()?);
        *slot = Arc::downgrade(&created);
        Ok(created)
    }

    pub fn spawn() -> Result<Scheduler> {
        let (wake_rx, wake_tx) = nonblocking_pipe()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            idle: Condvar::new(),
            wake_rx,
            wake_tx,
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name(SCHEDULER_THREAD_NAME.to_string())
            .spawn(move || run(worker))
            .map_err(|e| BridgeError::Scheduler(format!("failed to spawn event thread: {e}")))?;
        let thread_id = thread.thread().id();
        Ok(Self {
            shared,
            thread: Some(thread),
            thread_id,
        })
    }

    pub fn source_count(&self) -> usize {
        self.shared.lock().sources.len()
    }

    fn contains_any(&self, ids: &[SourceId]) -> bool {
        self.shared.lock().sources.iter().any(|s| ids.contains(&s.id))
    }

    fn register(
        &self,
        specs: impl IntoIterator<Item = (StreamDirection, PollDescriptor, Readiness)>,
        handler: &Arc<dyn EventHandler>,
    ) -> Vec<SourceId> {
        let mut st = self.shared.lock();
        let mut ids = Vec::new();
        for (stream, descriptor, interest) in specs {
            let id = st.next_id;
            st.next_id += 1;
            st.sources.push(Source {
                id,
                stream,
                descriptor,
                interest,
                handler: handler.clone(),
            });
            ids.push(id);
        }
        drop(st);
        self.shared.wake();
        ids
    }

    /// Removes `ids`. When this returns, none of their handlers is running and
    /// none will run again. Called from a handler, it cannot wait for itself.
    fn cancel(&self, ids: &[SourceId]) {
        if ids.is_empty() {
            return;
        }
        let mut st = self.shared.lock();
        st.sources.retain(|s| !ids.contains(&s.id));
        self.shared.wake();
        if std::thread::current().id() == self.thread_id {
            return;
        }
        while st.running.is_some_and(|id| ids.contains(&id)) {
            st = self
                .shared
                .idle
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake();
        if let Some(thread) = self.thread.take() {
            if std::thread::current().id() != self.thread_id {
                let _ = thread.join();
            }
        }
        debug!("event scheduler stopped");
    }
}

fn run(shared: Arc<Shared>) {
    let mut pollfds: Vec<libc::pollfd> = Vec::new();
    let mut ids: Vec<SourceId> = Vec::new();
    loop {
        {
            let st = shared.lock();
            if st.shutdown {
                return;
            }
            pollfds.clear();
            ids.clear();
            pollfds.push(libc::pollfd {
                fd: shared.wake_rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for src in &st.sources {
                pollfds.push(libc::pollfd {
                    fd: src.descriptor.fd,
                    events: src.interest.to_poll(),
                    revents: 0,
                });
                ids.push(src.id);
            }
        }

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = Errno::last();
            if err != Errno::EINTR {
                error!("event scheduler poll failed: {err}");
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            continue;
        }
        if pollfds[0].revents != 0 {
            shared.drain_wake();
        }
        for (pfd, id) in pollfds[1..].iter().zip(&ids) {
            if pfd.revents != 0 {
                dispatch(&shared, *id, pfd.revents);
            }
        }
    }
}

fn dispatch(shared: &Shared, id: SourceId, revents: libc::c_short) {
    let (handler, ctx) = {
        let mut st = shared.lock();
        if st.shutdown {
            return;
        }
        // Cancelled between poll and now.
        let Some(src) = st.sources.iter().find(|s| s.id == id) else {
            return;
        };
        let ctx = EventContext {
            source: src.id,
            stream: src.stream,
            descriptor: src.descriptor,
            interest: src.interest,
            fired: Readiness::from_poll(revents),
            error: revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
        };
        let handler = src.handler.clone();
        st.running = Some(id);
        (handler, ctx)
    };
    // A panicking handler must not take the shared thread down with it, nor
    // leave `running` set for a cancel to wait on.
    let disposition = match catch_unwind(AssertUnwindSafe(|| handler.handle(ctx))) {
        Ok(disposition) => disposition,
        Err(_) => {
            error!("event handler for source {id} panicked, source removed");
            Disposition::Remove
        }
    };
    let mut st = shared.lock();
    st.running = None;
    if disposition == Disposition::Remove {
        st.sources.retain(|s| s.id != id);
        warn!("{} source {id} no longer watched", ctx.stream.label());
    }
    drop(st);
    shared.idle.notify_all();
}

/// The sources one bridge instance keeps on a shared [`Scheduler`].
#[derive(Debug)]
pub struct EventDispatcher {
    scheduler: Arc<Scheduler>,
    sources: Vec<SourceId>,
}

impl EventDispatcher {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            sources: Vec::new(),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// True while at least one of this instance's sources is still watched.
    pub fn is_active(&self) -> bool {
        !self.sources.is_empty() && self.scheduler.contains_any(&self.sources)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Watches every descriptor in `set`, one source per readiness direction.
    pub fn register(
        &mut self,
        stream: StreamDirection,
        set: &DescriptorSet,
        handler: Arc<dyn EventHandler>,
    ) -> usize {
        let mut specs = Vec::new();
        for pfd in set {
            if pfd.events.readable {
                specs.push((stream, *pfd, Readiness::READ));
            }
            if pfd.events.writable {
                specs.push((stream, *pfd, Readiness::WRITE));
            }
        }
        let ids = self.scheduler.register(specs, &handler);
        let count = ids.len();
        self.sources.extend(ids);
        count
    }

    pub fn cancel(&mut self) {
        let ids = std::mem::take(&mut self.sources);
        self.scheduler.cancel(&ids);
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}
