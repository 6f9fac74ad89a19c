//! The backend adapter: generic engine contract on top of the server
//!
//! `PatchbayBackend` is the coordinator between four parties:
//! - the [`ServerConnection`] owning the client handle
//! - the generic engine, reached through [`EngineCallbacks`]
//! - the copy-on-write [`PortRegistry`](crate::backend::ports::PortRegistry)
//! - an optional [`SessionBridge`] for save/timebase requests
//!
//! It translates every server event into engine notifications, owns the
//! realtime process loop, and enforces the parameter contract: target
//! values are settable while disconnected, live values are authoritative
//! and mostly immutable while connected.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};

use crate::backend::engine::{EngineCallbacks, ProcessControl, TransportState};
use crate::backend::ports::PortHandle;
use crate::backend::ports::PortRegistry;
use crate::backend::session::SessionBridge;
use crate::backend::{rt, BackendError};
use crate::server::api::{
    DataKind, PortFlags, PortRef, SaveEvent, ServerApi, ServerEvents, ServerTransport,
    TransportPosition,
};
use crate::server::connection::ServerConnection;
use crate::server::discovery::{self, CommandLineOptions, SampleFormat};

/// One entry of the device union kept per driver.
///
/// `available` is false for a device that was seen (or configured) before
/// but is absent from the current enumeration, so UIs can keep showing a
/// temporarily unplugged device without offering it as selectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub name: String,
    pub available: bool,
}

/// Target parameters used to build the next startup command line.
///
/// Only consulted while disconnected; once connected the server's live
/// values are authoritative.
#[derive(Debug, Clone)]
pub struct TargetSettings {
    pub driver: String,
    pub device: String,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub num_periods: u32,
    pub input_channels: u32,
    pub output_channels: u32,
    pub systemic_input_latency: u32,
    pub systemic_output_latency: u32,
    pub midi_option: String,
    pub dither_mode: String,
    pub sample_format: SampleFormat,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            driver: discovery::default_audio_driver(),
            device: String::new(),
            sample_rate: 48000,
            buffer_size: 1024,
            num_periods: 2,
            input_channels: 0,
            output_channels: 0,
            systemic_input_latency: 0,
            systemic_output_latency: 0,
            midi_option: String::new(),
            dither_mode: String::new(),
            sample_format: SampleFormat::Float32,
        }
    }
}

/// Backend adapter binding the generic engine to the patchbay server
pub struct PatchbayBackend {
    connection: Arc<ServerConnection>,
    engine: Arc<dyn EngineCallbacks>,
    registry: PortRegistry,
    session: Mutex<Option<Arc<SessionBridge>>>,
    targets: Mutex<TargetSettings>,
    running: AtomicBool,
    freewheeling: AtomicBool,
    current_sample_rate: AtomicU32,
    current_buffer_size: AtomicU32,
    raw_audio_bytes: AtomicUsize,
    raw_midi_bytes: AtomicUsize,
    /// Every device ever seen or configured, keyed by driver name
    seen_devices: Mutex<HashMap<String, BTreeSet<String>>>,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    process_thread_ids: Mutex<Vec<ThreadId>>,
    suppress_connect_events: AtomicBool,
}

impl PatchbayBackend {
    pub fn new(connection: Arc<ServerConnection>, engine: Arc<dyn EngineCallbacks>) -> Arc<Self> {
        let backend = Arc::new(Self {
            connection,
            engine,
            registry: PortRegistry::new(),
            session: Mutex::new(None),
            targets: Mutex::new(TargetSettings::default()),
            running: AtomicBool::new(false),
            freewheeling: AtomicBool::new(false),
            current_sample_rate: AtomicU32::new(0),
            current_buffer_size: AtomicU32::new(0),
            raw_audio_bytes: AtomicUsize::new(0),
            raw_midi_bytes: AtomicUsize::new(0),
            seen_devices: Mutex::new(HashMap::new()),
            worker_threads: Mutex::new(Vec::new()),
            process_thread_ids: Mutex::new(Vec::new()),
            suppress_connect_events: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&backend);
        backend.connection.on_disconnected(Box::new(move |reason| {
            if let Some(backend) = weak.upgrade() {
                backend.disconnected(reason);
            }
        }));

        backend
    }

    /* ---- identity and availability ---- */

    pub fn name(&self) -> &'static str {
        "Patchbay"
    }

    /// True while the client handle exists
    pub fn available(&self) -> bool {
        self.connection.connected()
    }

    /// Current handle for collaborators that talk to the server directly
    pub fn handle(&self) -> Option<Arc<dyn ServerApi>> {
        self.connection.handle()
    }

    pub(crate) fn api(&self) -> Result<Arc<dyn ServerApi>, BackendError> {
        self.connection.handle().ok_or(BackendError::NotConnected)
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<ServerConnection> {
        &self.connection
    }

    pub fn is_realtime(&self) -> bool {
        match self.api() {
            Ok(api) => api.is_realtime(),
            Err(_) => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_freewheeling(&self) -> bool {
        self.freewheeling.load(Ordering::Acquire)
    }

    pub fn dsp_load(&self) -> f32 {
        match self.api() {
            Ok(api) => api.cpu_load(),
            Err(_) => 0.0,
        }
    }

    /// Bind the host session; timebase and save requests are forwarded to
    /// it from now on
    pub fn set_session(&self, session: Option<Arc<SessionBridge>>) {
        *self.session.lock().unwrap() = session;
    }

    /* ---- driver and device enumeration ---- */

    pub fn enumerate_drivers(&self) -> Vec<String> {
        discovery::audio_driver_names()
    }

    pub fn set_driver(&self, name: &str) -> Result<(), BackendError> {
        self.targets.lock().unwrap().driver = name.to_string();
        Ok(())
    }

    /// Devices for the selected driver: the union of everything seen so
    /// far, with currently visible devices marked available.
    ///
    /// The union is keyed per driver so devices of different low-level APIs
    /// are never mixed. A device the user configured stays listed even
    /// while unplugged.
    pub fn enumerate_devices(&self) -> Vec<DeviceStatus> {
        let driver = self.targets.lock().unwrap().driver.clone();
        let currently = discovery::devices_for_driver(&driver);

        let mut seen = self.seen_devices.lock().unwrap();
        let all = seen.entry(driver).or_default();
        for device in &currently {
            all.insert(device.clone());
        }

        all.iter()
            .map(|name| DeviceStatus {
                name: name.clone(),
                available: currently.contains(name),
            })
            .collect()
    }

    pub fn available_sample_rates(&self, device: &str) -> Vec<u32> {
        if self.available() && device == self.targets.lock().unwrap().device {
            return vec![self.sample_rate()];
        }
        // Not running yet: list reasonable candidates and let the server
        // sort it out later
        vec![8000, 16000, 22050, 32000, 44100, 48000, 88200, 96000, 192000]
    }

    pub fn available_buffer_sizes(&self, device: &str) -> Vec<u32> {
        if self.available() && device == self.targets.lock().unwrap().device {
            return vec![self.buffer_size()];
        }
        vec![8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192]
    }

    pub fn available_period_counts(&self, driver: &str) -> Vec<u32> {
        if discovery::driver_supports_period_count(driver) {
            vec![2, 3]
        } else {
            Vec::new()
        }
    }

    pub fn available_input_channel_count(&self, _device: &str) -> u32 {
        128
    }

    pub fn available_output_channel_count(&self, _device: &str) -> u32 {
        128
    }

    pub fn enumerate_midi_options(&self) -> Vec<String> {
        discovery::midi_option_names()
    }

    /* ---- parameter setters ---- */

    pub fn set_device_name(&self, device: &str) -> Result<(), BackendError> {
        if self.available() {
            if self.targets.lock().unwrap().device == device {
                return Ok(());
            }
            // The server must be restarted to change devices
            return Err(BackendError::NotWhileRunning("device"));
        }

        let mut targets = self.targets.lock().unwrap();
        targets.device = device.to_string();
        // Remember the configured device so enumeration never forgets it
        self.seen_devices
            .lock()
            .unwrap()
            .entry(targets.driver.clone())
            .or_default()
            .insert(device.to_string());
        Ok(())
    }

    pub fn set_sample_rate(&self, rate: u32) -> Result<(), BackendError> {
        if !self.available() {
            self.targets.lock().unwrap().sample_rate = rate;
            return Ok(());
        }

        let api = self.api()?;
        if rate == api.sample_rate() {
            return Ok(());
        }
        Err(BackendError::NotWhileRunning("sample rate"))
    }

    /// Buffer size is the one parameter the server can change live
    pub fn set_buffer_size(&self, frames: u32) -> Result<(), BackendError> {
        if !self.available() {
            self.targets.lock().unwrap().buffer_size = frames;
            return Ok(());
        }

        let api = self.api()?;
        if frames == api.buffer_size() {
            return Ok(());
        }
        api.set_buffer_size(frames)?;
        Ok(())
    }

    pub fn set_period_count(&self, count: u32) -> Result<(), BackendError> {
        if self.available() {
            if self.targets.lock().unwrap().num_periods == count {
                return Ok(());
            }
            return Err(BackendError::NotWhileRunning("period count"));
        }
        self.targets.lock().unwrap().num_periods = count;
        Ok(())
    }

    pub fn set_input_channels(&self, count: u32) -> Result<(), BackendError> {
        if self.available() {
            if self.targets.lock().unwrap().input_channels == count {
                return Ok(());
            }
            return Err(BackendError::NotWhileRunning("input channel count"));
        }
        self.targets.lock().unwrap().input_channels = count;
        Ok(())
    }

    pub fn set_output_channels(&self, count: u32) -> Result<(), BackendError> {
        if self.available() {
            if self.targets.lock().unwrap().output_channels == count {
                return Ok(());
            }
            return Err(BackendError::NotWhileRunning("output channel count"));
        }
        self.targets.lock().unwrap().output_channels = count;
        Ok(())
    }

    pub fn set_systemic_input_latency(&self, frames: u32) -> Result<(), BackendError> {
        if self.available() {
            if self.targets.lock().unwrap().systemic_input_latency == frames {
                return Ok(());
            }
            return Err(BackendError::NotWhileRunning("systemic input latency"));
        }
        self.targets.lock().unwrap().systemic_input_latency = frames;
        Ok(())
    }

    pub fn set_systemic_output_latency(&self, frames: u32) -> Result<(), BackendError> {
        if self.available() {
            if self.targets.lock().unwrap().systemic_output_latency == frames {
                return Ok(());
            }
            return Err(BackendError::NotWhileRunning("systemic output latency"));
        }
        self.targets.lock().unwrap().systemic_output_latency = frames;
        Ok(())
    }

    /// Only affects the next startup command line, so it is settable at any
    /// time
    pub fn set_midi_option(&self, option: &str) -> Result<(), BackendError> {
        self.targets.lock().unwrap().midi_option = option.to_string();
        Ok(())
    }

    pub fn set_dither_mode(&self, mode: &str) -> Result<(), BackendError> {
        self.targets.lock().unwrap().dither_mode = mode.to_string();
        Ok(())
    }

    pub fn set_sample_format(&self, format: SampleFormat) -> Result<(), BackendError> {
        self.targets.lock().unwrap().sample_format = format;
        Ok(())
    }

    /* ---- parameter getters ---- */

    pub fn driver_name(&self) -> String {
        if !self.connection.in_control() {
            // An externally managed server cannot report what driver it was
            // started with
            return String::new();
        }
        self.targets.lock().unwrap().driver.clone()
    }

    pub fn device_name(&self) -> String {
        if !self.connection.in_control() {
            return String::new();
        }
        self.targets.lock().unwrap().device.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        if !self.connection.in_control() {
            if self.available() {
                return self.current_sample_rate.load(Ordering::Acquire);
            }
            return self.connection.probed_sample_rate();
        }
        if self.available() {
            let current = self.current_sample_rate.load(Ordering::Acquire);
            if current != 0 {
                return current;
            }
        }
        self.targets.lock().unwrap().sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        if !self.connection.in_control() {
            if self.available() {
                return self.current_buffer_size.load(Ordering::Acquire);
            }
            return self.connection.probed_buffer_size();
        }
        if self.available() {
            let current = self.current_buffer_size.load(Ordering::Acquire);
            if current != 0 {
                return current;
            }
        }
        self.targets.lock().unwrap().buffer_size
    }

    /// Sample rate as measured on the live connection; 0 while unmeasured
    pub fn measured_sample_rate(&self) -> u32 {
        self.current_sample_rate.load(Ordering::Acquire)
    }

    /// Buffer size as measured on the live connection; 0 while unmeasured
    pub fn measured_buffer_size(&self) -> u32 {
        self.current_buffer_size.load(Ordering::Acquire)
    }

    pub fn period_count(&self) -> u32 {
        self.targets.lock().unwrap().num_periods
    }

    pub fn input_channels(&self) -> u32 {
        if self.available() {
            return self.physical_channel_count(true);
        }
        if self.connection.in_control() {
            self.targets.lock().unwrap().input_channels
        } else {
            0
        }
    }

    pub fn output_channels(&self) -> u32 {
        if self.available() {
            return self.physical_channel_count(false);
        }
        if self.connection.in_control() {
            self.targets.lock().unwrap().output_channels
        } else {
            0
        }
    }

    pub fn systemic_input_latency(&self) -> u32 {
        self.targets.lock().unwrap().systemic_input_latency
    }

    pub fn systemic_output_latency(&self) -> u32 {
        self.targets.lock().unwrap().systemic_output_latency
    }

    pub fn midi_option(&self) -> String {
        self.targets.lock().unwrap().midi_option.clone()
    }

    /// Raw bytes available per port buffer for `kind`, as measured on the
    /// live connection; 0 while unmeasured
    pub fn raw_buffer_size(&self, kind: DataKind) -> usize {
        match kind {
            DataKind::Audio => self.raw_audio_bytes.load(Ordering::Acquire),
            DataKind::Midi => self.raw_midi_bytes.load(Ordering::Acquire),
        }
    }

    pub fn can_change_sample_rate_when_running(&self) -> bool {
        false
    }

    pub fn can_change_buffer_size_when_running(&self) -> bool {
        true
    }

    /// Physical source (`capture == true`) or sink port count on the server
    fn physical_channel_count(&self, capture: bool) -> u32 {
        let Ok(api) = self.api() else {
            return 0;
        };
        let flags = if capture {
            // Hardware capture ports produce data, so they carry the output
            // flag from the client's point of view
            PortFlags::output().physical(true)
        } else {
            PortFlags::input().physical(true)
        };
        api.list_ports(None, Some(DataKind::Audio), flags).len() as u32
    }

    /* ---- lifecycle ---- */

    /// Write the startup command the server library will use when it
    /// auto-starts the server for us
    fn setup_startup_command(&self, for_latency_measurement: bool) {
        let targets = self.targets.lock().unwrap().clone();

        let mut options = CommandLineOptions {
            driver: targets.driver,
            input_device: targets.device.clone(),
            output_device: targets.device,
            sample_rate: targets.sample_rate,
            period_size: targets.buffer_size,
            num_periods: targets.num_periods,
            input_channels: targets.input_channels,
            output_channels: targets.output_channels,
            dither_mode: targets.dither_mode,
            sample_format: targets.sample_format,
            ports_max: 2048,
            // Any server we start ourselves must exit with its last client
            temporary: true,
            ..Default::default()
        };

        if for_latency_measurement {
            // Zeroed so latency probing is not polluted by previously
            // configured offsets
            options.input_latency = 0;
            options.output_latency = 0;
        } else {
            options.input_latency = targets.systemic_input_latency;
            options.output_latency = targets.systemic_output_latency;
        }

        if let Some(path) = discovery::default_server_path() {
            options.server_path = path;
        }

        if let Err(e) = discovery::apply_midi_option(&mut options, &targets.midi_option) {
            tracing::warn!(error = %e, "ignoring unknown MIDI option");
        }

        match discovery::build_command_line(&options) {
            Ok(line) => {
                tracing::info!(command = %line, "server startup command");
                let _ = discovery::write_config_file(&discovery::config_file_path(), &line);
            }
            Err(e) => {
                // The server will still auto-start, just without our
                // preferred options
                tracing::warn!(error = %e, "could not build startup command, server will use defaults");
            }
        }
    }

    /// Connect (starting the server if we are in control), measure, rebuild
    /// ports, install callbacks and activate.
    ///
    /// With `for_latency_measurement` set, systemic latencies are zeroed in
    /// the startup command.
    pub fn start(self: &Arc<Self>, for_latency_measurement: bool) -> Result<(), BackendError> {
        if !self.available() {
            if self.connection.in_control() {
                self.setup_startup_command(for_latency_measurement);
            }
            self.connection.open()?;
        }

        let api = self.api()?;

        // Buffer sizes and sample rate must reach the engine before ports
        // are re-established, because buffer allocation depends on them
        self.sample_rate_event(api.sample_rate());
        self.buffer_size_event(api.buffer_size());

        if let Err(e) = self.engine.reestablish_ports() {
            tracing::error!(error = %e, "could not re-establish ports after connecting");
            // Tear the connection down again so a failed start leaves the
            // backend fully stopped, not half-connected
            let _ = self.connection.close();
            return Err(BackendError::PortSetup(e.to_string()));
        }

        api.set_event_handler(Arc::clone(self) as Arc<dyn ServerEvents>);

        let this = Arc::clone(self);
        api.set_process_target(Box::new(move || this.process_loop()));

        match api.activate() {
            Ok(()) => {
                self.running.store(true, Ordering::Release);
            }
            Err(e) => {
                // Soft failure: connected but not processing until the
                // caller stops and retries
                tracing::warn!(error = %e, "cannot activate client");
            }
        }

        self.engine.reconnect_ports();
        Ok(())
    }

    /// Stop processing and tear the connection down.
    ///
    /// The running flag clears first so concurrent realtime checks observe
    /// it immediately; measured values reset via the disconnect path.
    pub fn stop(&self) -> Result<(), BackendError> {
        self.running.store(false, Ordering::Release);

        if !self.connection.connected() {
            return Err(BackendError::NotConnected);
        }
        let _ = self.connection.close();
        Ok(())
    }

    /// Toggle freewheeling; a no-op if already in the requested state
    pub fn freewheel(&self, onoff: bool) -> Result<(), BackendError> {
        let api = self.api()?;

        if onoff == self.freewheeling.load(Ordering::Acquire) {
            // already doing what has been asked for
            return Ok(());
        }

        api.set_freewheel(onoff)?;
        self.freewheeling.store(onoff, Ordering::Release);
        Ok(())
    }

    fn disconnected(&self, reason: &str) {
        let was_running = self.running.swap(false, Ordering::AcqRel);

        // Never report stale measurements as live
        self.current_sample_rate.store(0, Ordering::Release);
        self.current_buffer_size.store(0, Ordering::Release);
        self.raw_audio_bytes.store(0, Ordering::Release);
        self.raw_midi_bytes.store(0, Ordering::Release);
        self.freewheeling.store(false, Ordering::Release);

        // The wrappers hold server-native references that just died
        self.registry.clear();

        if was_running {
            self.engine.halted(reason);
        }
    }

    /* ---- realtime processing ---- */

    /// Entry point of the server-created process thread
    fn process_loop(self: Arc<Self>) {
        self.note_process_thread(std::thread::current().id());
        self.engine.thread_init();

        loop {
            // Re-load the handle every cycle: disconnection may race the
            // loop, and a dead handle means nothing is pending to touch
            let Some(api) = self.connection.handle() else {
                return;
            };
            let Some(frames) = api.cycle_wait() else {
                return;
            };

            if self.engine.process(frames) == ProcessControl::Stop {
                return;
            }

            api.cycle_signal(0);
        }
    }

    fn note_process_thread(&self, id: ThreadId) {
        let mut ids = self.process_thread_ids.lock().unwrap();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    /// Spawn an additional processing thread at the server's realtime
    /// priority (for multi-threaded graph processing)
    pub fn create_process_thread(
        &self,
        f: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<(), BackendError> {
        let api = self.api()?;
        let priority = api.real_time_priority();

        let thread = std::thread::Builder::new()
            .name("patchbay-worker".to_string())
            .spawn(move || {
                rt::promote_current_thread(priority);
                f();
            })
            .map_err(|e| BackendError::Thread(e.to_string()))?;

        self.note_process_thread(thread.thread().id());
        self.worker_threads.lock().unwrap().push(thread);
        Ok(())
    }

    /// Wait for every extra processing thread to finish
    pub fn join_process_threads(&self) -> Result<(), BackendError> {
        let threads: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.worker_threads.lock().unwrap());

        let mut failures = 0;
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("cannot stop process thread");
                failures += 1;
            }
        }
        if failures == 0 {
            Ok(())
        } else {
            Err(BackendError::Thread(format!(
                "{} process threads did not stop cleanly",
                failures
            )))
        }
    }

    /// True on the main process thread or any worker created through
    /// `create_process_thread`
    pub fn in_process_thread(&self) -> bool {
        self.process_thread_ids
            .lock()
            .unwrap()
            .contains(&std::thread::current().id())
    }

    pub fn process_thread_count(&self) -> usize {
        self.worker_threads.lock().unwrap().len()
    }

    pub fn client_real_time_priority(&self) -> i32 {
        match self.api() {
            Ok(api) => api.real_time_priority(),
            Err(_) => 0,
        }
    }

    /* ---- transport ---- */

    pub fn transport_start(&self) {
        if let Ok(api) = self.api() {
            api.transport_start();
        }
    }

    pub fn transport_stop(&self) {
        if let Ok(api) = self.api() {
            api.transport_stop();
        }
    }

    pub fn transport_locate(&self, frame: u64) {
        if let Ok(api) = self.api() {
            api.transport_locate(frame);
        }
    }

    pub fn transport_sample(&self) -> u64 {
        match self.api() {
            Ok(api) => api.transport_frame(),
            Err(_) => 0,
        }
    }

    pub fn transport_state(&self) -> TransportState {
        let Ok(api) = self.api() else {
            return TransportState::Stopped;
        };
        let (state, _) = api.transport_query();
        translate_transport(state).unwrap_or(TransportState::Starting)
    }

    /// Claim or release the timebase-master role for this client
    pub fn set_time_master(&self, yn: bool) -> Result<(), BackendError> {
        let api = self.api()?;
        api.set_timebase(yn)?;
        Ok(())
    }

    /// Fill transport speed and position; returns true while the transport
    /// is still starting
    pub fn speed_and_position(&self, speed: &mut f64, position: &mut u64) -> bool {
        *speed = 0.0;
        *position = 0;

        let Ok(api) = self.api() else {
            return true;
        };

        let (state, pos) = api.transport_query();
        *position = pos.frame;

        match state {
            ServerTransport::Stopped => {
                *speed = 0.0;
                false
            }
            ServerTransport::Rolling | ServerTransport::Looping => {
                *speed = 1.0;
                false
            }
            ServerTransport::Starting => true,
            ServerTransport::NetStarting => {
                tracing::warn!("unknown server transport state, treating as starting");
                true
            }
        }
    }

    /// Ask the server to recompute latency chains
    pub fn update_latencies(&self) {
        if let Ok(api) = self.api() {
            api.recompute_latencies();
        }
    }

    /* ---- bulk port teardown ---- */

    /// Suppress connection-change notifications while `f` removes many
    /// ports, to avoid redundant storms
    pub fn with_bulk_port_cleanup<R>(&self, f: impl FnOnce() -> R) -> R {
        self.suppress_connect_events.store(true, Ordering::Release);
        let result = f();
        self.suppress_connect_events.store(false, Ordering::Release);
        result
    }

    /* ---- server event translation (inherent handlers) ---- */

    fn sample_rate_event(&self, rate: u32) {
        if rate == self.current_sample_rate.load(Ordering::Acquire) {
            return;
        }
        self.current_sample_rate.store(rate, Ordering::Release);
        self.engine.sample_rate_changed(rate);
    }

    fn buffer_size_event(&self, frames: u32) {
        if frames == self.current_buffer_size.load(Ordering::Acquire) {
            return;
        }
        self.current_buffer_size.store(frames, Ordering::Release);

        if let Ok(api) = self.api() {
            self.raw_audio_bytes
                .store(api.buffer_capacity(DataKind::Audio), Ordering::Release);
            self.raw_midi_bytes
                .store(api.buffer_capacity(DataKind::Midi), Ordering::Release);
        }

        self.engine.buffer_size_changed(frames);
    }

    fn registration_event(&self, port: PortRef, name: &str, registered: bool) {
        if registered {
            // Ports we registered ourselves are tracked at registration
            // time; only foreign ports get inserted here
            if let Ok(api) = self.api() {
                let ours = name.starts_with(&format!("{}:", api.client_name()));
                if !ours && self.registry.lookup(name).is_none() {
                    if let (Some(kind), Some(flags)) = (api.port_kind(port), api.port_flags(port)) {
                        self.registry.insert(Arc::new(PortHandle::new(
                            name.to_string(),
                            kind,
                            flags,
                            port,
                            false,
                        )));
                    }
                }
            }
        } else {
            self.registry.remove(name);
        }

        self.engine.latency_updated(false);
        self.engine.latency_updated(true);
        self.engine.ports_changed();
        self.engine.graph_reordered();
    }
}

impl Drop for PatchbayBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn translate_transport(state: ServerTransport) -> Option<TransportState> {
    match state {
        ServerTransport::Stopped => Some(TransportState::Stopped),
        ServerTransport::Rolling => Some(TransportState::Rolling),
        ServerTransport::Looping => Some(TransportState::Looping),
        ServerTransport::Starting => Some(TransportState::Starting),
        // Vendor-extension states stay untranslated
        ServerTransport::NetStarting => None,
    }
}

impl ServerEvents for PatchbayBackend {
    fn sample_rate_changed(&self, rate: u32) {
        self.sample_rate_event(rate);
    }

    fn buffer_size_changed(&self, frames: u32) {
        self.buffer_size_event(frames);
    }

    fn xrun(&self) {
        // Swallowed while tearing down
        if self.available() {
            self.engine.xrun();
        }
    }

    fn freewheel_changed(&self, on: bool) {
        self.freewheeling.store(on, Ordering::Release);
        self.engine.freewheel_changed(on);
    }

    fn sync(&self, state: ServerTransport, frame: u64) -> bool {
        match translate_transport(state) {
            Some(tstate) => self.engine.sync(tstate, frame),
            // Unofficial states are ignored, not propagated
            None => true,
        }
    }

    fn timebase(
        &self,
        state: ServerTransport,
        nframes: u32,
        pos: &mut TransportPosition,
        new_position: bool,
    ) {
        let session = self.session.lock().unwrap().clone();
        if let Some(bridge) = session {
            bridge.timebase_query(state, nframes, pos, new_position);
        }
    }

    fn session_event(&self, event: SaveEvent) {
        let session = self.session.lock().unwrap().clone();
        let Some(bridge) = session else {
            return;
        };
        if let Ok(api) = self.api() {
            bridge.handle_save_request(api.as_ref(), event);
        }
    }

    fn port_registration(&self, port: PortRef, name: &str, registered: bool) {
        self.registration_event(port, name, registered);
    }

    fn ports_connected(&self, a: &str, b: &str, connected: bool) {
        if self.suppress_connect_events.load(Ordering::Acquire) {
            return;
        }
        self.engine.connection_changed(a, b, connected);
    }

    fn graph_reordered(&self) {
        self.engine.graph_reordered();
    }

    fn latency_changed(&self, playback: bool) {
        self.engine.latency_updated(playback);
    }
}
