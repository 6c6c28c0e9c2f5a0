//! Camera lifecycle controller.
//!
//! [`CameraController`] is the context of the driver's state machine. It owns
//! the SDK handle, the per-arm acquisition state and the image outputs, and
//! implements every transition action of the camera lifecycle:
//!
//! ```text
//! Uninitialised -> Unconnected -> Idle <-> Armed <-> Acquiring
//!                                   |        \-> ExternalAcquiring
//!                                   \-> UnarmedAcquiring
//! ```
//!
//! SDK failures never escape an action. They are logged, written to the status
//! message, and turned into the failure branch of the transition.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bcd::BcdDecoder;
use crate::buffers::{self, AllocatedBuffers};
use crate::config::{DriverConfig, TimerConfig};
use crate::error::{AppResult, DriverError};
use crate::gang::MemberConfig;
use crate::geometry;
use crate::image::AttributeValue;
use crate::pipeline::{AcquisitionContext, Outputs};
use crate::sdk::{
    AcquireMode, BitAlignment, CameraDescription, CameraSdk, HardwareRoi, TimestampMode,
    TriggerMode,
};
use crate::state_machine::{Branch, Control, EventId, StateId, StateMachine, TimerId};
use crate::status::{CameraInfo, PerfEvent, Settings, Shared};
use crate::timing;

/// Lifecycle states.
#[derive(Debug, Clone, Copy)]
pub struct States {
    /// Before the driver has started.
    pub uninitialised: StateId,
    /// Waiting to (re)connect to the camera.
    pub unconnected: StateId,
    /// Connected and configured, not recording.
    pub idle: StateId,
    /// Recording, waiting for an acquisition to start.
    pub armed: StateId,
    /// Acquisition started from Armed.
    pub acquiring: StateId,
    /// Acquisition started straight from Idle; disarms when done.
    pub unarmed_acquiring: StateId,
    /// Acquisition started by an external trigger while Armed.
    pub external_acquiring: StateId,
}

/// Lifecycle events.
#[derive(Debug, Clone, Copy)]
pub struct Events {
    /// Posted once when the driver starts.
    pub initialise: EventId,
    /// The default timer expired (connect, reboot and polls).
    pub timer_expiry: EventId,
    /// User command.
    pub acquire: EventId,
    /// User command.
    pub stop: EventId,
    /// User command.
    pub arm: EventId,
    /// A frame is waiting in the pending queue.
    pub image_received: EventId,
    /// User command.
    pub disarm: EventId,
    /// Software trigger, from the user or the retry timer.
    pub trigger: EventId,
    /// User command.
    pub reboot: EventId,
    /// The gang coordinator has completed images.
    pub make_images: EventId,
}

/// Tokens of a built lifecycle machine.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    /// Registered states.
    pub states: States,
    /// Registered events.
    pub events: Events,
    /// Retries a software trigger the camera did not accept.
    pub trigger_timer: TimerId,
}

/// Result of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Camera open and initialised.
    Connected,
    /// Failed; the reconnect timer is running.
    Retry,
}

impl From<ConnectOutcome> for Branch {
    fn from(outcome: ConnectOutcome) -> Self {
        match outcome {
            ConnectOutcome::Connected => Branch::First,
            ConnectOutcome::Retry => Branch::Second,
        }
    }
}

/// Result of arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// Camera recording with buffers submitted.
    Armed,
    /// Everything acquired during the attempt was released.
    Failed,
}

impl From<ArmOutcome> for Branch {
    fn from(outcome: ArmOutcome) -> Self {
        match outcome {
            ArmOutcome::Armed => Branch::First,
            ArmOutcome::Failed => Branch::Second,
        }
    }
}

/// Result of handling received or gang-completed images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    /// The acquisition wants more images.
    More,
    /// Complete, and the camera was disarmed.
    Disarmed,
    /// Complete, the camera stays armed for the next acquisition.
    StayArmed,
    /// Images arrived before the acquisition started and were thrown away.
    Discarded,
}

impl From<ImageOutcome> for Branch {
    fn from(outcome: ImageOutcome) -> Self {
        match outcome {
            ImageOutcome::More => Branch::First,
            ImageOutcome::Disarmed => Branch::Second,
            ImageOutcome::StayArmed => Branch::Third,
            ImageOutcome::Discarded => Branch::Fourth,
        }
    }
}

/// Result of stopping an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Back to Idle.
    Disarmed,
    /// Software-triggered cameras go back to Armed.
    StayArmed,
}

impl From<StopOutcome> for Branch {
    fn from(outcome: StopOutcome) -> Self {
        match outcome {
            StopOutcome::Disarmed => Branch::First,
            StopOutcome::StayArmed => Branch::Second,
        }
    }
}

/// Context of the lifecycle machine: the camera and everything an action needs.
pub struct CameraController {
    sdk: Arc<dyn CameraSdk>,
    shared: Arc<Shared>,
    outputs: Outputs,
    timing: TimerConfig,
    port_name: String,
    events: Events,
    trigger_timer: TimerId,
    description: Option<CameraDescription>,
    bcd: BcdDecoder,
    acquisition: Option<AcquisitionContext>,
    /// Output sequence id carried across acquisitions.
    array_counter: u64,
    /// The last cooling setpoint write failed and is retried on the idle poll.
    cooling_pending: bool,
}

impl CameraController {
    /// Build the lifecycle state machine with a controller as its context.
    pub fn machine(
        config: &DriverConfig,
        sdk: Arc<dyn CameraSdk>,
        shared: Arc<Shared>,
        outputs: Outputs,
    ) -> (StateMachine<Self>, Lifecycle) {
        let mut builder = StateMachine::builder(config.driver.port_name.clone());
        let states = States {
            uninitialised: builder.state("Uninitialised"),
            unconnected: builder.state("Unconnected"),
            idle: builder.state("Idle"),
            armed: builder.state("Armed"),
            acquiring: builder.state("Acquiring"),
            unarmed_acquiring: builder.state("UnarmedAcquiring"),
            external_acquiring: builder.state("ExternalAcquiring"),
        };
        let events = Events {
            initialise: builder.event("Initialise"),
            timer_expiry: builder.event("TimerExpiry"),
            acquire: builder.event("Acquire"),
            stop: builder.event("Stop"),
            arm: builder.event("Arm"),
            image_received: builder.event("ImageReceived"),
            disarm: builder.event("Disarm"),
            trigger: builder.event("Trigger"),
            reboot: builder.event("Reboot"),
            make_images: builder.event("MakeImages"),
        };
        let trigger_timer = builder.timer();

        let (s, e) = (states, events);
        builder.transition(s.uninitialised, e.initialise, initialise_wait, &[s.unconnected]);
        builder.transition(s.unconnected, e.timer_expiry, connect, &[s.idle, s.unconnected]);

        builder.transition(s.idle, e.timer_expiry, poll_while_idle, &[s.idle]);
        builder.transition(s.idle, e.arm, request_arm, &[s.armed, s.idle]);
        builder.transition(s.idle, e.acquire, arm_and_acquire, &[s.unarmed_acquiring, s.idle]);
        builder.transition(s.idle, e.image_received, discard_images, &[s.idle]);
        builder.transition(s.idle, e.reboot, request_reboot, &[s.unconnected]);

        builder.transition(s.armed, e.timer_expiry, poll_while_acquiring, &[s.armed]);
        builder.transition(s.armed, e.acquire, acquire, &[s.acquiring]);
        builder.transition(
            s.armed,
            e.image_received,
            first_image_while_armed,
            &[s.external_acquiring, s.idle, s.armed, s.armed],
        );
        builder.transition(s.armed, e.disarm, disarm_and_discard, &[s.idle]);
        builder.transition(s.armed, e.stop, disarm_and_discard, &[s.idle]);

        builder.transition(s.acquiring, e.timer_expiry, poll_while_acquiring, &[s.acquiring]);
        builder.transition(
            s.acquiring,
            e.image_received,
            acquire_image,
            &[s.acquiring, s.idle, s.armed],
        );
        builder.transition(
            s.acquiring,
            e.make_images,
            make_ganged_image,
            &[s.acquiring, s.idle, s.armed],
        );
        builder.transition(s.acquiring, e.trigger, trigger, &[s.acquiring]);
        builder.transition(s.acquiring, e.stop, stop_acquisition, &[s.idle, s.armed]);

        builder.transition(
            s.external_acquiring,
            e.timer_expiry,
            poll_while_acquiring,
            &[s.external_acquiring],
        );
        builder.transition(
            s.external_acquiring,
            e.image_received,
            external_acquire_image,
            &[s.external_acquiring, s.idle, s.armed],
        );
        builder.transition(
            s.external_acquiring,
            e.make_images,
            make_ganged_image,
            &[s.external_acquiring, s.idle, s.armed],
        );
        builder.transition(s.external_acquiring, e.stop, external_stop, &[s.idle]);

        builder.transition(
            s.unarmed_acquiring,
            e.timer_expiry,
            poll_while_acquiring,
            &[s.unarmed_acquiring],
        );
        builder.transition(
            s.unarmed_acquiring,
            e.image_received,
            unarmed_acquire_image,
            &[s.unarmed_acquiring, s.idle],
        );
        builder.transition(
            s.unarmed_acquiring,
            e.make_images,
            unarmed_make_ganged_image,
            &[s.unarmed_acquiring, s.idle],
        );
        builder.transition(s.unarmed_acquiring, e.trigger, trigger, &[s.unarmed_acquiring]);
        builder.transition(s.unarmed_acquiring, e.stop, external_stop, &[s.idle]);

        builder.initial_state(s.uninitialised);

        let controller = CameraController {
            sdk,
            shared: Arc::clone(&shared),
            outputs,
            timing: config.timing.clone(),
            port_name: config.driver.port_name.clone(),
            events,
            trigger_timer,
            description: None,
            bcd: BcdDecoder::default(),
            acquisition: None,
            array_counter: 0,
            cooling_pending: false,
        };
        let mut machine = builder.build(controller, config.driver.request_queue_capacity);

        shared.update_status(|status| status.state = "Uninitialised".to_string());
        let observed = Arc::clone(&shared);
        machine.set_observer(move |change| {
            let state = change.to.to_string();
            let transition = change.to_string();
            observed.update_status(|status| {
                status.state = state;
                status.last_transition = transition;
            });
        });

        (
            machine,
            Lifecycle {
                states,
                events,
                trigger_timer,
            },
        )
    }

    /// Disarm and close the camera. Called once the state machine has stopped.
    pub fn release(&mut self) {
        if self.acquisition.is_some() {
            self.do_disarm();
        }
        if let Err(e) = self.sdk.close() {
            warn!(port = %self.port_name, error = %e, "close on shutdown failed");
        }
        self.shared.update_status(|s| {
            s.connected = false;
            s.acquiring = false;
        });
        info!(port = %self.port_name, "camera released");
    }

    fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.shared.update_status(|s| s.message = message);
    }

    fn trigger_mode(&self) -> TriggerMode {
        self.acquisition
            .as_ref()
            .map(|acq| acq.trigger_mode)
            .unwrap_or_default()
    }

    // ---- connection ------------------------------------------------------

    fn connect(&mut self, ctl: &mut Control<'_>) -> ConnectOutcome {
        // A handle may survive a failed attempt or a reboot
        if let Err(e) = self.sdk.close() {
            debug!(port = %self.port_name, error = %e, "close before open failed");
        }

        match self.open_and_initialise() {
            Ok(()) => {
                let discarded = self.shared.frames.discard();
                if discarded > 0 {
                    debug!(port = %self.port_name, discarded, "stale frames discarded on connect");
                }
                self.send_member_config();
                self.shared.update_status(|s| {
                    s.connected = true;
                    s.message.clear();
                });
                ctl.start_timer(self.timing.status_poll_period, self.events.timer_expiry);
                self.shared.count(PerfEvent::Connect);
                info!(port = %self.port_name, "camera connected");
                ConnectOutcome::Connected
            }
            Err(e) => {
                warn!(
                    port = %self.port_name,
                    error = %e,
                    retry_in = ?self.timing.reconnect_period,
                    "camera connection failed"
                );
                self.shared.update_status(|s| {
                    s.connected = false;
                    s.message = format!("Connect failed: {e}");
                });
                ctl.start_timer(self.timing.reconnect_period, self.events.timer_expiry);
                ConnectOutcome::Retry
            }
        }
    }

    fn open_and_initialise(&mut self) -> AppResult<()> {
        self.sdk.open()?;
        self.initialise_camera()
    }

    /// Bring a freshly opened camera to a known default configuration.
    fn initialise_camera(&mut self) -> AppResult<()> {
        let mut description = self.sdk.describe()?;
        if description.camera_type.is_dimax() {
            // the dimax reports 2, it only accepts multiples of 4
            description.roi_step_vertical = 4;
        }

        if let Err(e) = self.sdk.set_recording(false) {
            debug!(error = %e, "recording off failed during initialise");
        }
        if let Err(e) = self.sdk.reset_settings() {
            debug!(error = %e, "settings reset failed during initialise");
        }

        self.sdk.set_date_time(Utc::now().naive_utc())?;
        self.sdk.set_binning(1, 1)?;
        let sizes = self.sdk.sizes()?;
        let step_x = description.roi_step_horizontal.max(1);
        let step_y = description.roi_step_vertical.max(1);
        self.sdk.set_roi(HardwareRoi {
            x0: 1,
            y0: 1,
            x1: (sizes.max_width / step_x * step_x).max(1),
            y1: (sizes.max_height / step_y * step_y).max(1),
        })?;
        self.sdk.set_trigger_mode(TriggerMode::Auto)?;
        if description.supports_timestamp {
            let mode = supported_timestamp_mode(&description, TimestampMode::BinaryAndAscii);
            self.sdk.set_timestamp_mode(mode)?;
        }
        self.sdk.set_acquire_mode(AcquireMode::Auto)?;
        let defaults = self.shared.settings().timing;
        self.sdk
            .set_delay_exposure(timing::plan(&description, &defaults))?;
        let pixel_rate = self.sdk.pixel_rate()?;
        let recording = self.sdk.is_recording()?;

        self.bcd = BcdDecoder::new(description.dynamic_resolution, description.bit_alignment);
        let info = CameraInfo {
            camera_type: description.camera_type,
            serial_number: description.serial_number,
            max_width: description.max_width,
            max_height: description.max_height,
            dynamic_resolution: description.dynamic_resolution,
        };
        info!(
            port = %self.port_name,
            camera = %info.camera_type,
            serial = info.serial_number,
            width = info.max_width,
            height = info.max_height,
            recording,
            "camera initialised"
        );
        self.shared.update_status(|s| {
            s.camera = Some(info);
            s.pixel_rate = pixel_rate;
        });
        self.apply_cooling(&description, None);
        self.description = Some(description);

        self.poll_storage();
        self.poll_camera();
        Ok(())
    }

    fn request_reboot(&mut self, ctl: &mut Control<'_>) {
        ctl.stop_all_timers();
        let events = ctl.clear();
        let frames = self.shared.frames.discard();
        self.shared.count(PerfEvent::Reboot);
        info!(port = %self.port_name, events, frames, "rebooting camera");

        if self
            .description
            .as_ref()
            .is_some_and(|d| d.camera_type.is_edge())
        {
            if let Err(e) = self.sdk.reboot() {
                warn!(port = %self.port_name, error = %e, "camera reboot failed");
            }
        }
        if let Err(e) = self.sdk.close() {
            warn!(port = %self.port_name, error = %e, "close after reboot failed");
        }
        self.description = None;
        self.shared.update_status(|s| {
            s.connected = false;
            s.message = "Rebooting".to_string();
        });
        ctl.start_timer(self.timing.reboot_period, self.events.timer_expiry);
    }

    /// Set the ADC count and bit alignment, returning what the camera reports.
    fn apply_readout(
        &self,
        description: &CameraDescription,
        settings: &Settings,
    ) -> AppResult<(u32, BitAlignment)> {
        let adc_count = if description.num_adcs > 1 {
            self.sdk
                .set_adc_operation(description.clamp_adc_count(settings.adc_count))?;
            self.sdk.adc_operation()?
        } else {
            1
        };
        self.sdk.set_bit_alignment(settings.bit_alignment)?;
        let bit_alignment = self.sdk.bit_alignment()?;
        Ok((adc_count, bit_alignment))
    }

    /// Write the cooling setpoint, or the camera default for `None`. Failures
    /// are logged and retried on the idle poll.
    fn apply_cooling(&mut self, description: &CameraDescription, requested: Option<i16>) {
        if !description.has_cooling() {
            self.cooling_pending = false;
            return;
        }
        let target = description
            .clamp_cooling_setpoint(requested.unwrap_or(description.default_cooling_setpoint));
        if let Err(e) = self.sdk.set_cooling_setpoint(target) {
            warn!(port = %self.port_name, error = %e, target, "cooling setpoint not accepted");
            self.cooling_pending = true;
            return;
        }
        self.cooling_pending = false;
        match self.sdk.cooling_setpoint() {
            Ok(actual) => self
                .shared
                .update_status(|s| s.cooling_setpoint = Some(actual)),
            Err(e) => warn!(port = %self.port_name, error = %e, "cooling setpoint readback failed"),
        }
    }

    fn retry_cooling(&mut self) {
        if !self.cooling_pending {
            return;
        }
        if let Some(description) = self.description.clone() {
            let requested = self.shared.settings().cooling_setpoint;
            self.apply_cooling(&description, requested);
        }
    }

    // ---- polling ---------------------------------------------------------

    fn poll_storage(&self) {
        match self.sdk.storage_mode() {
            Ok(mode) => self.shared.update_status(|s| s.storage_mode = Some(mode)),
            Err(e) => warn!(port = %self.port_name, error = %e, "storage mode poll failed"),
        }
    }

    fn poll_camera(&self) {
        match self.sdk.temperatures() {
            Ok(temperatures) => self.shared.update_status(|s| s.temperatures = temperatures),
            Err(e) => warn!(port = %self.port_name, error = %e, "temperature poll failed"),
        }
        match self.sdk.ram_usage() {
            Ok(ram) => {
                let mut percent = ram.percent_used().floor();
                // a few stored images must not read as an empty memory
                if ram.images_stored > 0 && percent == 0.0 {
                    percent = 1.0;
                }
                self.shared.update_status(|s| s.ram_used_percent = percent);
            }
            Err(e) => warn!(port = %self.port_name, error = %e, "camera RAM poll failed"),
        }
    }

    // ---- arm / disarm ----------------------------------------------------

    fn request_arm(&mut self, ctl: &mut Control<'_>) -> ArmOutcome {
        match self.do_arm() {
            Ok(()) => {
                ctl.start_timer(self.timing.status_poll_period, self.events.timer_expiry);
                self.set_message("");
                ArmOutcome::Armed
            }
            Err(e) => {
                self.arm_failed(ctl, &e);
                ArmOutcome::Failed
            }
        }
    }

    fn arm_and_acquire(&mut self, ctl: &mut Control<'_>) -> ArmOutcome {
        match self.do_arm() {
            Ok(()) => {
                self.now_acquiring();
                self.start_camera(ctl);
                ctl.start_timer(self.timing.acquisition_poll_period, self.events.timer_expiry);
                self.set_message("");
                ArmOutcome::Armed
            }
            Err(e) => {
                self.arm_failed(ctl, &e);
                ArmOutcome::Failed
            }
        }
    }

    fn arm_failed(&mut self, ctl: &mut Control<'_>, e: &DriverError) {
        self.acquisition_complete(ctl);
        self.do_disarm();
        let message = match e {
            DriverError::OutOfMemory(_) => format!("Arm failed, out of memory: {e}"),
            _ => format!("Arm failed: {e}"),
        };
        error!(port = %self.port_name, error = %e, "arm failed");
        self.set_message(message);
    }

    /// Configure the camera from the current settings and start recording.
    fn do_arm(&mut self) -> AppResult<()> {
        let settings = self.shared.settings();
        let described = self
            .description
            .clone()
            .ok_or_else(|| DriverError::Configuration("camera not described".to_string()))?;

        let (adc_count, bit_alignment) = self.apply_readout(&described, &settings)?;
        self.apply_cooling(&described, settings.cooling_setpoint);
        // geometry and frame stamps follow the readout actually in effect
        let description = CameraDescription {
            num_adcs: adc_count,
            bit_alignment,
            ..described
        };
        self.bcd = BcdDecoder::new(description.dynamic_resolution, bit_alignment);

        let plan = geometry::plan(&description, &settings.geometry);
        self.sdk.set_binning(plan.hardware_bin_x, plan.hardware_bin_y)?;
        self.sdk.set_roi(plan.hardware_roi)?;

        let hardware_trigger = match settings.trigger_mode {
            TriggerMode::ExternalOnly => TriggerMode::External,
            mode => mode,
        };
        self.sdk.set_trigger_mode(hardware_trigger)?;

        let timestamp_mode = supported_timestamp_mode(&description, settings.timestamp_mode);
        if description.supports_timestamp {
            self.sdk.set_timestamp_mode(timestamp_mode)?;
        }
        self.sdk.set_acquire_mode(AcquireMode::Auto)?;

        if settings.pixel_rate != 0 {
            self.sdk.set_pixel_rate(settings.pixel_rate)?;
        }
        let pixel_rate = self.sdk.pixel_rate()?;

        self.sdk
            .set_delay_exposure(timing::plan(&description, &settings.timing))?;
        let readback = self.sdk.delay_exposure()?;
        let achieved = timing::achieved(&settings.timing, &readback);

        let slots = self.shared.arena.lock().len();
        let buffers = AllocatedBuffers::reserve(
            self.sdk.as_ref(),
            slots,
            plan.frame_width,
            plan.frame_height,
        )?;
        self.shared.arena.lock().install(buffers);

        self.shared.update_settings(|s| {
            s.geometry.min_x = plan.effective_min_x;
            s.geometry.min_y = plan.effective_min_y;
            s.geometry.size_x = plan.effective_size_x;
            s.geometry.size_y = plan.effective_size_y;
            s.timestamp_mode = timestamp_mode;
            s.timing.exposure = achieved.exposure;
            s.timing.delay = achieved.delay;
            s.pixel_rate = pixel_rate;
            s.adc_count = adc_count;
            s.bit_alignment = bit_alignment;
        });
        self.shared.update_status(|s| {
            s.geometry = Some(plan);
            s.timing = achieved;
            s.pixel_rate = pixel_rate;
            s.adc_count = adc_count;
            s.bit_alignment = bit_alignment;
        });
        self.send_member_config();
        self.sdk.set_date_time(Utc::now().naive_utc())?;

        buffers::submit_all(&self.shared.arena, self.sdk.as_ref())?;
        let armed_settings = self.shared.settings();
        self.acquisition = Some(AcquisitionContext::new(
            &armed_settings,
            plan,
            achieved,
            self.bcd,
        ));

        self.sdk.arm()?;
        self.sdk.set_recording(true)?;
        self.shared.update_status(|s| s.armed = true);
        self.shared.count(PerfEvent::Arm);

        let (width, height) = plan.output_size();
        info!(
            port = %self.port_name,
            trigger = ?settings.trigger_mode,
            width,
            height,
            exposure = achieved.exposure,
            period = achieved.period,
            "camera armed"
        );
        Ok(())
    }

    /// Stop recording and give every buffer back to the SDK.
    fn do_disarm(&mut self) {
        if let Err(e) = self.sdk.set_recording(false) {
            warn!(port = %self.port_name, error = %e, "recording off failed");
        }
        let released = self.shared.arena.lock().take_all();
        released.free(self.sdk.as_ref());
        self.acquisition = None;
        self.shared.update_status(|s| {
            s.armed = false;
            s.acquiring = false;
        });
        debug!(port = %self.port_name, "camera disarmed");
    }

    fn discard_frames(&self) {
        let discarded = self.shared.frames.discard();
        if discarded > 0 {
            debug!(port = %self.port_name, discarded, "queued frames discarded");
        }
    }

    // ---- acquisition -----------------------------------------------------

    fn now_acquiring(&mut self) {
        let settings = self.shared.settings();
        let attributes = self.image_attributes();
        self.shared.reset_counters();
        self.shared.count(PerfEvent::Start);
        let array_counter = self.array_counter;
        if let Some(acq) = self.acquisition.as_mut() {
            acq.start(&settings, array_counter);
            acq.set_attributes(attributes);
            info!(
                port = %self.port_name,
                images = acq.num_images,
                exposures = acq.num_exposures,
                mode = ?acq.image_mode,
                "acquisition started"
            );
        }
        self.shared.update_status(|s| s.acquiring = true);
    }

    fn acquisition_complete(&mut self, ctl: &mut Control<'_>) {
        ctl.stop(self.trigger_timer);
        self.shared.update_status(|s| s.acquiring = false);
        if let Some(acq) = &self.acquisition {
            info!(port = %self.port_name, images = acq.images_counter, "acquisition complete");
        }
    }

    /// Force an exposure in the modes that need one, retrying on a timer
    /// while the camera refuses.
    fn start_camera(&mut self, ctl: &mut Control<'_>) {
        if !self.trigger_mode().needs_forced_trigger() {
            return;
        }
        let accepted = match self.sdk.force_trigger() {
            Ok(accepted) => accepted,
            Err(e) => {
                self.shared.count(PerfEvent::DriverError);
                warn!(port = %self.port_name, error = %e, "force trigger failed");
                false
            }
        };
        if !accepted {
            debug!(port = %self.port_name, "trigger not accepted, retrying");
            ctl.start(self.trigger_timer, self.timing.trigger_retry_period, self.events.trigger);
        }
    }

    fn receive(&mut self) -> bool {
        let Some(acq) = self.acquisition.as_mut() else {
            let discarded = self.shared.frames.discard();
            warn!(port = %self.port_name, discarded, "frames without an acquisition discarded");
            return false;
        };
        let complete = acq.receive_images(&self.shared, &mut self.outputs);
        self.array_counter = acq.array_counter;
        complete
    }

    fn make(&mut self) -> bool {
        let Some(acq) = self.acquisition.as_mut() else {
            return false;
        };
        let complete = acq.make_images(&self.shared, &mut self.outputs);
        self.array_counter = acq.array_counter;
        complete
    }

    /// Complete an acquisition. Software-triggered cameras stay armed.
    fn complete_unless_software(&mut self, ctl: &mut Control<'_>) -> ImageOutcome {
        self.acquisition_complete(ctl);
        if self.trigger_mode() == TriggerMode::Software {
            ImageOutcome::StayArmed
        } else {
            self.do_disarm();
            ImageOutcome::Disarmed
        }
    }

    /// Complete an acquisition. Only free-running cameras are disarmed.
    fn complete_if_auto(&mut self, ctl: &mut Control<'_>) -> ImageOutcome {
        self.acquisition_complete(ctl);
        if self.trigger_mode() == TriggerMode::Auto {
            self.do_disarm();
            ImageOutcome::Disarmed
        } else {
            ImageOutcome::StayArmed
        }
    }

    fn first_image_while_armed(&mut self, ctl: &mut Control<'_>) -> ImageOutcome {
        if self.trigger_mode() == TriggerMode::Software {
            self.discard_frames();
            return ImageOutcome::Discarded;
        }
        self.now_acquiring();
        if !self.receive() {
            return ImageOutcome::More;
        }
        self.complete_if_auto(ctl)
    }

    fn acquire_image(&mut self, ctl: &mut Control<'_>) -> ImageOutcome {
        if !self.receive() {
            self.start_camera(ctl);
            return ImageOutcome::More;
        }
        self.complete_unless_software(ctl)
    }

    fn external_acquire_image(&mut self, ctl: &mut Control<'_>) -> ImageOutcome {
        if !self.receive() {
            return ImageOutcome::More;
        }
        self.complete_if_auto(ctl)
    }

    fn unarmed_acquire_image(&mut self, ctl: &mut Control<'_>) -> ImageOutcome {
        if !self.receive() {
            self.start_camera(ctl);
            return ImageOutcome::More;
        }
        self.finish_unarmed(ctl)
    }

    fn finish_unarmed(&mut self, ctl: &mut Control<'_>) -> ImageOutcome {
        self.acquisition_complete(ctl);
        self.do_disarm();
        self.discard_frames();
        ImageOutcome::Disarmed
    }

    fn make_ganged_image(&mut self, ctl: &mut Control<'_>) -> ImageOutcome {
        if !self.make() {
            return ImageOutcome::More;
        }
        self.complete_unless_software(ctl)
    }

    fn unarmed_make_ganged_image(&mut self, ctl: &mut Control<'_>) -> ImageOutcome {
        if !self.make() {
            return ImageOutcome::More;
        }
        self.finish_unarmed(ctl)
    }

    fn stop_acquisition(&mut self, ctl: &mut Control<'_>) -> StopOutcome {
        let outcome = match self.complete_unless_software(ctl) {
            ImageOutcome::StayArmed => StopOutcome::StayArmed,
            _ => StopOutcome::Disarmed,
        };
        self.discard_frames();
        outcome
    }

    fn external_stop(&mut self, ctl: &mut Control<'_>) {
        self.acquisition_complete(ctl);
        self.do_disarm();
        self.discard_frames();
    }

    fn image_attributes(&self) -> BTreeMap<String, AttributeValue> {
        let status = self.shared.status();
        let mut attributes = BTreeMap::new();
        if let Some(camera) = &status.camera {
            attributes.insert(
                "CameraModel".to_string(),
                AttributeValue::Text(camera.camera_type.to_string()),
            );
            attributes.insert(
                "CameraSerial".to_string(),
                AttributeValue::Int(i64::from(camera.serial_number)),
            );
        }
        attributes.insert(
            "SensorTemperature".to_string(),
            AttributeValue::Float(status.temperatures.sensor),
        );
        attributes.insert(
            "ExposureTime".to_string(),
            AttributeValue::Float(status.timing.exposure),
        );
        attributes.insert(
            "AcquirePeriod".to_string(),
            AttributeValue::Float(status.timing.period),
        );
        attributes
    }

    fn send_member_config(&mut self) {
        let settings = self.shared.settings();
        let status = self.shared.status();
        let (width, height) = status
            .geometry
            .map(|g| g.output_size())
            .or_else(|| status.camera.as_ref().map(|c| (c.max_width, c.max_height)))
            .unwrap_or_default();
        self.outputs.gang.send_member_config(&MemberConfig {
            port_name: self.port_name.clone(),
            width,
            height,
            trigger_mode: settings.trigger_mode,
            image_mode: settings.image_mode,
            num_images: settings.num_images,
            num_exposures: settings.num_exposures,
            exposure: status.timing.exposure,
            period: status.timing.period,
        });
    }
}

/// The closest timestamp mode the camera can do.
fn supported_timestamp_mode(
    description: &CameraDescription,
    requested: TimestampMode,
) -> TimestampMode {
    if !description.supports_timestamp {
        return TimestampMode::None;
    }
    match requested {
        TimestampMode::Ascii if !description.supports_ascii_timestamp => {
            TimestampMode::BinaryAndAscii
        }
        mode => mode,
    }
}

// ---- transition actions ----------------------------------------------------

fn initialise_wait(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    info!(port = %c.port_name, delay = ?c.timing.connect_period, "waiting to connect");
    ctl.start_timer(c.timing.connect_period, c.events.timer_expiry);
    Branch::First
}

fn connect(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.connect(ctl).into()
}

fn poll_while_idle(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.retry_cooling();
    c.poll_storage();
    c.poll_camera();
    ctl.start_timer(c.timing.status_poll_period, c.events.timer_expiry);
    Branch::First
}

fn poll_while_acquiring(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.poll_camera();
    ctl.start_timer(c.timing.acquisition_poll_period, c.events.timer_expiry);
    Branch::First
}

fn request_arm(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.request_arm(ctl).into()
}

fn arm_and_acquire(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.arm_and_acquire(ctl).into()
}

fn acquire(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.now_acquiring();
    c.start_camera(ctl);
    ctl.start_timer(c.timing.acquisition_poll_period, c.events.timer_expiry);
    Branch::First
}

fn discard_images(c: &mut CameraController, _ctl: &mut Control<'_>) -> Branch {
    c.discard_frames();
    Branch::First
}

fn request_reboot(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.request_reboot(ctl);
    Branch::First
}

fn first_image_while_armed(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.first_image_while_armed(ctl).into()
}

fn disarm_and_discard(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.acquisition_complete(ctl);
    c.do_disarm();
    c.discard_frames();
    Branch::First
}

fn acquire_image(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.acquire_image(ctl).into()
}

fn make_ganged_image(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.make_ganged_image(ctl).into()
}

fn trigger(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.start_camera(ctl);
    Branch::First
}

fn stop_acquisition(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.stop_acquisition(ctl).into()
}

fn external_acquire_image(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.external_acquire_image(ctl).into()
}

fn external_stop(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.external_stop(ctl);
    Branch::First
}

fn unarmed_acquire_image(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.unarmed_acquire_image(ctl).into()
}

fn unarmed_make_ganged_image(c: &mut CameraController, ctl: &mut Control<'_>) -> Branch {
    c.unarmed_make_ganged_image(ctl).into()
}
