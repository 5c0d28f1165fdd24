use crate::buffer::{AudioBufferGroup, InputConsumer, PullRenderer, RenderFlags, TimeStamp};
use crate::dispatch::{Disposition, EventContext, EventDispatcher, EventHandler, Scheduler};
use crate::error::{BackendError, BridgeError, Result, Status};
use crate::format::SampleFormatDescriptor;
use crate::hw::config::BridgeOptions;
use crate::hw::traits::{DescriptorSet, PcmBackend, PcmStream, StreamDirection};
use crate::pump::IoPump;
use crate::render::RenderAdapter;
use crate::session::DeviceSession;
use nix::libc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Input,
    Output,
}

struct Core<S: PcmStream> {
    label: &'static str,
    output: DeviceSession<S>,
    input: DeviceSession<S>,
    output_format: SampleFormatDescriptor,
    input_format: SampleFormatDescriptor,
    enable_output: bool,
    enable_input: bool,
    renderer: Option<Box<dyn PullRenderer>>,
    adapter: RenderAdapter,
    pump: IoPump,
    /// Connection loss seen on the event thread since the last `start`.
    fault: Option<Status>,
}

impl<S: PcmStream> Core<S> {
    fn is_initialized(&self) -> bool {
        self.output.is_open() || self.input.is_open()
    }

    fn is_started(&self) -> bool {
        self.output.is_started() || self.input.is_started()
    }

    fn session(&self, direction: StreamDirection) -> &DeviceSession<S> {
        match direction {
            StreamDirection::Output => &self.output,
            StreamDirection::Input => &self.input,
        }
    }

    fn open_directions<B>(&mut self, backend: &B, options: &BridgeOptions) -> Result<()>
    where
        B: PcmBackend<Stream = S>,
    {
        if self.enable_output {
            self.output.open(backend, &options.device)?;
            self.output.negotiate(&self.output_format, options)?;
        }
        if self.enable_input {
            self.input.open(backend, &options.device)?;
            self.input.negotiate(&self.input_format, options)?;
        }
        Ok(())
    }

    fn prepare_directions(&mut self) -> Result<Vec<(StreamDirection, DescriptorSet)>> {
        let mut sets = Vec::with_capacity(2);
        if self.input.is_open() {
            sets.push((StreamDirection::Input, self.input.prepare()?));
        }
        if self.output.is_open() {
            sets.push((StreamDirection::Output, self.output.prepare()?));
        }
        Ok(sets)
    }

    fn drop_directions(&mut self) {
        self.input.drop_pending();
        self.output.drop_pending();
    }

    fn close_directions(&mut self) {
        self.output.close();
        self.input.close();
    }

    /// Records a connection loss; the caller stops watching the source.
    fn fail(&mut self, direction: StreamDirection, e: &BridgeError) -> Disposition {
        let status = e.status();
        error!("{} {} connection lost ({:?}): {}", self.label, direction.label(), status, e);
        self.fault = Some(status);
        Disposition::Remove
    }

    fn process_event(&mut self, ctx: &EventContext) -> Disposition {
        let Some(stream) = self.session(ctx.stream).stream() else {
            return Disposition::Remove;
        };
        let ready = match stream.revents(&ctx.descriptor, ctx.fired) {
            Ok(ready) => ready,
            Err(e) => {
                error!("{} poll revents failed: {}", self.label, e);
                return Disposition::Keep;
            }
        };
        if ready.is_empty() {
            if ctx.error {
                warn!(
                    "{} {} reported an error condition, recovering",
                    self.label,
                    ctx.stream.label()
                );
                if let Err(e) = stream.recover(&BackendError::from_errno(libc::EPIPE)) {
                    return self.fail(ctx.stream, &BridgeError::DeviceWriteFailed(e));
                }
            }
            return Disposition::Keep;
        }
        if ready.readable {
            self.pump.on_read_ready(ctx.stream);
        }
        if ready.writable && ctx.stream == StreamDirection::Output {
            let label = self.label;
            let Core {
                output,
                renderer,
                adapter,
                pump,
                ..
            } = &mut *self;
            let Some(renderer) = renderer.as_mut() else {
                return Disposition::Keep;
            };
            match pump.on_write_ready(&mut **renderer, adapter, output) {
                Ok(()) => {}
                Err(
                    e @ (BridgeError::DeviceWriteFailed(_) | BridgeError::RecoveryExhausted(_)),
                ) => return self.fail(ctx.stream, &e),
                Err(e) => error!("{} playback cycle failed ({:?}): {}", label, e.status(), e),
            }
        }
        Disposition::Keep
    }
}

struct StreamEvents<S: PcmStream> {
    core: Weak<Mutex<Core<S>>>,
}

impl<S: PcmStream> EventHandler for StreamEvents<S> {
    fn handle(&self, ctx: EventContext) -> Disposition {
        let Some(core) = self.core.upgrade() else {
            return Disposition::Remove;
        };
        let mut core = core.lock().unwrap_or_else(PoisonError::into_inner);
        core.process_event(&ctx)
    }
}

/// Connects a pull renderer to an event-driven PCM device.
///
/// `init` opens and configures the enabled directions, `start` prepares them
/// and begins pumping on device readiness, `stop` ends the started period and
/// releases the streams. The renderer runs on the shared event thread and must
/// not call back into the bridge.
pub struct PcmBridge<B: PcmBackend> {
    backend: B,
    options: BridgeOptions,
    core: Arc<Mutex<Core<B::Stream>>>,
    dispatcher: EventDispatcher,
}

impl<B: PcmBackend> std::fmt::Debug for PcmBridge<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.lock();
        f.debug_struct("PcmBridge")
            .field("backend", &B::LABEL)
            .field("options", &self.options)
            .field("output", &core.output.state())
            .field("input", &core.input.state())
            .field("sources", &self.dispatcher.source_count())
            .finish()
    }
}

impl<B: PcmBackend> PcmBridge<B> {
    pub fn new(backend: B, options: BridgeOptions) -> Result<Self> {
        Ok(Self::with_scheduler(backend, options, Scheduler::shared()?))
    }

    pub fn with_scheduler(backend: B, options: BridgeOptions, scheduler: Arc<Scheduler>) -> Self {
        let core = Core {
            label: B::LABEL,
            output: DeviceSession::new(B::LABEL, StreamDirection::Output),
            input: DeviceSession::new(B::LABEL, StreamDirection::Input),
            output_format: SampleFormatDescriptor::default(),
            input_format: SampleFormatDescriptor::default(),
            enable_output: true,
            enable_input: false,
            renderer: None,
            adapter: RenderAdapter::new(B::LABEL, options.max_recoveries),
            pump: IoPump::new(B::LABEL, options.frame_quantum, options.should_allocate_buffer),
            fault: None,
        };
        Self {
            backend,
            options,
            core: Arc::new(Mutex::new(core)),
            dispatcher: EventDispatcher::new(scheduler),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core<B::Stream>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_initialized()
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_active()
    }

    /// Status of the connection loss that ended pumping since the last `start`.
    pub fn last_error(&self) -> Option<Status> {
        self.lock().fault
    }

    pub fn negotiated_rate(&self, direction: StreamDirection) -> Option<u32> {
        self.lock().session(direction).config().map(|c| c.rate)
    }

    pub fn enable_io(&mut self, direction: StreamDirection, enabled: bool) -> Result<()> {
        let mut core = self.lock();
        if core.is_initialized() {
            return Err(BridgeError::AlreadyInitialized);
        }
        match direction {
            StreamDirection::Output => core.enable_output = enabled,
            StreamDirection::Input => core.enable_input = enabled,
        }
        Ok(())
    }

    pub fn set_stream_format(
        &mut self,
        direction: StreamDirection,
        desc: SampleFormatDescriptor,
    ) -> Result<()> {
        let mut core = self.lock();
        if core.is_initialized() {
            return Err(BridgeError::AlreadyInitialized);
        }
        match direction {
            StreamDirection::Output => core.output_format = desc,
            StreamDirection::Input => {
                core.input_format = desc;
                core.adapter.set_input_planar(desc.is_planar());
            }
        }
        Ok(())
    }

    pub fn stream_format(&self, direction: StreamDirection) -> SampleFormatDescriptor {
        let core = self.lock();
        match direction {
            StreamDirection::Output => core.output_format,
            StreamDirection::Input => core.input_format,
        }
    }

    pub fn set_render_source<R: PullRenderer + 'static>(&mut self, renderer: R) {
        self.lock().renderer = Some(Box::new(renderer));
    }

    pub fn clear_render_source(&mut self) {
        self.lock().renderer = None;
    }

    /// Registers (or clears) the consumer captured audio is pushed to. Without
    /// one, input is poll-only.
    pub fn set_input_callback(&mut self, consumer: Option<Box<dyn InputConsumer>>) {
        self.lock().adapter.set_input_consumer(consumer);
    }

    /// Opens and configures every enabled direction. Fails without side effects
    /// when a stream is already open; on any other failure nothing stays open.
    pub fn init(&mut self) -> Result<()> {
        let mut core = self.lock();
        if core.is_initialized() {
            return Err(BridgeError::AlreadyInitialized);
        }
        if let Err(e) = core.open_directions(&self.backend, &self.options) {
            error!("{} init failed: {}", B::LABEL, e);
            core.close_directions();
            return Err(BridgeError::InitializationFailed(Box::new(e)));
        }
        debug!("{} initialized", B::LABEL);
        Ok(())
    }

    pub fn deinit(&mut self) -> Result<()> {
        self.dispatcher.cancel();
        let mut core = self.lock();
        if core.is_started() {
            core.drop_directions();
        }
        core.close_directions();
        Ok(())
    }

    /// Prepares the open directions and starts watching their descriptors.
    /// Either everything starts or both directions are dropped again.
    pub fn start(&mut self) -> Result<()> {
        let sets = {
            let mut core = self.lock();
            if core.is_started() {
                return Ok(());
            }
            if !core.is_initialized() {
                return Err(BridgeError::NotInitialized);
            }
            if core.output.is_open() && core.renderer.is_none() {
                return Err(BridgeError::NoRenderSource);
            }
            core.pump.reset_clock();
            core.fault = None;
            match core.prepare_directions() {
                Ok(sets) => sets,
                Err(e) => {
                    error!("{} start failed: {}", B::LABEL, e);
                    core.drop_directions();
                    return Err(BridgeError::InitializationFailed(Box::new(e)));
                }
            }
        };

        let handler: Arc<dyn EventHandler> = Arc::new(StreamEvents {
            core: Arc::downgrade(&self.core),
        });
        for (direction, set) in &sets {
            if set.is_empty() {
                self.dispatcher.cancel();
                self.lock().drop_directions();
                let e = BridgeError::PrepareFailed(format!(
                    "{} stream has no poll descriptors",
                    direction.label()
                ));
                error!("{} start failed: {}", B::LABEL, e);
                return Err(BridgeError::InitializationFailed(Box::new(e)));
            }
            let count = self.dispatcher.register(*direction, set, handler.clone());
            debug!(
                "{} {} watching {} sources",
                B::LABEL,
                direction.label(),
                count
            );
        }
        Ok(())
    }

    /// Cancels event delivery, then discards buffered frames and closes both
    /// directions. A session that never started is left untouched.
    pub fn stop(&mut self) -> Result<()> {
        self.dispatcher.cancel();
        let mut core = self.lock();
        if !core.is_started() {
            return Ok(());
        }
        core.drop_directions();
        core.close_directions();
        debug!("{} stopped", B::LABEL);
        Ok(())
    }

    /// Lets queued output play out. Event delivery stops first so nothing is
    /// queued behind the drain.
    pub fn drain(&mut self) -> Result<()> {
        self.dispatcher.cancel();
        self.lock().output.drain()
    }

    pub fn reset(&mut self, scope: Scope, element: u32) -> Result<()> {
        debug!("{} reset({:?}, {}) is not supported", B::LABEL, scope, element);
        Err(BridgeError::NotImplemented("reset"))
    }

    /// Host entry point: bus 0 writes `buffers` to the device, bus 1 serves input.
    pub fn render(
        &self,
        flags: &mut RenderFlags,
        timestamp: &TimeStamp,
        bus: u32,
        frames: u32,
        buffers: &AudioBufferGroup,
    ) -> Result<()> {
        let mut core = self.lock();
        let Core { adapter, output, .. } = &mut *core;
        adapter.render(output, flags, timestamp, bus, frames, buffers)
    }
}

impl<B: PcmBackend> Drop for PcmBridge<B> {
    fn drop(&mut self) {
        let _ = self.stop();
        let _ = self.deinit();
    }
}
