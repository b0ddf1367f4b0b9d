//! The RNDIS data path and its lifecycle.
//!
//! All mutable driver state sits behind one gate (a mutex). Bulk completions
//! can arrive on any thread; they take the gate, look at the state, and let
//! go of it again before calling upstream into the network stack. RNDIS
//! control commands and pipe aborts also run with the gate released. Bulk
//! submissions happen under the gate, and so does the bounded stall clear
//! that a refused submission triggers; clearing a stall never runs a
//! completion, so it cannot re-enter the gate. Enable and disable are
//! serialised by a separate "transition in flight" flag so that a disable
//! arriving in the middle of an enable waits for it instead of tearing down
//! half-built state.

use std::sync::{Arc, Weak};

use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::codec;
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::matching::{self, InterfaceMatch};
use crate::net::{EthernetAddress, NetworkStack};
use crate::pool::{BufferHandle, BufferPool};
use crate::protocol::{PacketFilter, DATA_HEADER_LEN};
use crate::session::{RndisSession, SessionInfo};
use crate::usb::{
    self, ConfigurationDescriptor, InterfaceDescriptor, SubmitError, Transfer, TransferBuffer,
    TransferError, UsbDevice,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Attached, never enabled.
    Inactive,
    /// An enable or disable is running.
    Transitioning,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStatus {
    /// The frame is on its way. With `stall` set the pool is now empty and
    /// the caller should hold further frames until
    /// [`NetworkStack::queue_service`] fires.
    Accepted { stall: bool },
    /// No buffer free; the frame was not consumed.
    RetryStall,
    /// The frame was consumed and thrown away.
    Dropped,
}

struct State {
    session: Option<Arc<RndisSession>>,
    enabled: bool,
    ever_enabled: bool,
    transition_in_flight: bool,
    ready_to_transfer: bool,
    data_dead: bool,
    /// Transfers submitted whose completion has not finished running.
    callback_count: usize,
    out_pool: Option<BufferPool>,
    /// Receive buffers between allocation and their first submission.
    in_buffers: Vec<TransferBuffer>,
    mtu: u32,
}

impl State {
    fn allocate(&mut self, config: &DriverConfig) {
        self.out_pool = Some(BufferPool::new(
            config.out_buffer_count,
            config.out_buffer_size,
        ));
        self.in_buffers = (0..config.in_buffer_count)
            .map(|_| TransferBuffer::new(config.in_buffer_size))
            .collect();
        debug!(
            "rndis: allocated {} out and {} in buffers",
            config.out_buffer_count, config.in_buffer_count
        );
    }

    fn release_resources(&mut self) {
        self.out_pool = None;
        self.in_buffers.clear();
    }
}

struct Shared {
    config: DriverConfig,
    net: Arc<dyn NetworkStack>,
    mtu_limit: u32,
    gate: Mutex<State>,
    transition_done: Condvar,
    callbacks_drained: Condvar,
}

/// Marks an enable/disable in flight; clears the mark and wakes waiters
/// when dropped.
struct TransitionGuard<'a> {
    shared: &'a Shared,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.shared.gate.lock();
        st.transition_in_flight = false;
        self.shared.transition_done.notify_all();
    }
}

impl Shared {
    fn begin_transition(&self) -> TransitionGuard<'_> {
        let mut st = self.gate.lock();
        if st.transition_in_flight {
            debug!("rndis: transition in progress, waiting");
        }
        while st.transition_in_flight {
            self.transition_done.wait(&mut st);
        }
        st.transition_in_flight = true;
        TransitionGuard { shared: self }
    }

    fn callback_exit(&self, st: &mut State) {
        match st.callback_count.checked_sub(1) {
            Some(remaining) => {
                st.callback_count = remaining;
                if remaining == 0 {
                    self.callbacks_drained.notify_all();
                }
            }
            None => {
                error!("rndis: completion with no outstanding transfer, stopping data path");
                st.ready_to_transfer = false;
                st.data_dead = true;
            }
        }
    }

    fn stop_queue(&self) {
        self.net.queue_stop();
        self.net.queue_set_capacity(0);
        self.net.queue_flush();
    }

    fn read_transfer(self: &Arc<Self>, buffer: TransferBuffer) -> Transfer {
        let weak: Weak<Shared> = Arc::downgrade(self);
        Transfer::bulk_in(
            buffer,
            Box::new(move |result, buffer| {
                if let Some(shared) = weak.upgrade() {
                    shared.read_complete(result, buffer);
                }
            }),
        )
    }

    fn start_readers(self: &Arc<Self>, session: &RndisSession) -> Result<()> {
        let mut st = self.gate.lock();
        st.ready_to_transfer = true;
        st.data_dead = false;

        let buffers = std::mem::take(&mut st.in_buffers);
        for buffer in buffers {
            let transfer = self.read_transfer(buffer);
            match usb::submit_with_stall_retry(
                session.in_pipe(),
                transfer,
                self.config.stall_clear_attempts,
            ) {
                Ok(()) => st.callback_count += 1,
                Err(SubmitError { error, .. }) => {
                    error!("rndis: cannot start bulk in reader: {}", error);
                    st.ready_to_transfer = false;
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }

    /// Cancels outstanding transfers, waits for every completion to finish
    /// and frees the buffers. Must be called with `ready_to_transfer` off
    /// and the gate released.
    fn drain(&self, session: Option<&RndisSession>) {
        if let Some(session) = session {
            session.abort_pipes(self.config.stall_clear_attempts);
        }

        let mut st = self.gate.lock();
        if st.callback_count > 0 {
            debug!(
                "rndis: waiting for {} outstanding completions",
                st.callback_count
            );
        }
        while st.callback_count > 0 {
            self.callbacks_drained.wait(&mut st);
        }
        st.release_resources();
    }

    fn read_complete(self: &Arc<Self>, result: Result<usize, TransferError>, buffer: TransferBuffer) {
        let stopping = matches!(&result, Err(err) if err.is_stop());
        let session = {
            let mut st = self.gate.lock();
            match st.session.clone() {
                Some(session) if st.ready_to_transfer && !stopping => session,
                _ => {
                    debug!("rndis: bulk in reader exiting ({:?})", result.err());
                    self.callback_exit(&mut st);
                    return;
                }
            }
        };

        match result {
            Ok(len) => self.deliver(&buffer[..len.min(buffer.len())]),
            Err(err) => {
                error!("rndis: bulk in failed: {}", err);
                if err == TransferError::Stalled {
                    if let Err(err) =
                        usb::clear_stall(session.in_pipe(), self.config.stall_clear_attempts)
                    {
                        error!("rndis: cannot clear bulk in stall: {}", err);
                    }
                }
            }
        }

        let mut st = self.gate.lock();
        if !st.ready_to_transfer {
            debug!("rndis: bulk in reader exiting, data path stopped");
            self.callback_exit(&mut st);
            return;
        }
        let transfer = self.read_transfer(buffer);
        if let Err(err) =
            usb::submit_with_stall_retry(session.in_pipe(), transfer, self.config.stall_clear_attempts)
        {
            error!(
                "rndis: cannot requeue bulk in ({}), receive path is dead",
                err.error
            );
            st.data_dead = true;
            self.callback_exit(&mut st);
        }
    }

    /// Splits a completed read and hands every frame upstream.
    fn deliver(&self, bytes: &[u8]) {
        match codec::decode_data_frames(bytes) {
            Ok(frames) => {
                trace!("rndis: {} frames in {} bytes", frames.len(), bytes.len());
                for frame in frames {
                    self.net.frame_received(frame);
                    self.net.input_success();
                }
            }
            Err(err) => {
                error!(
                    "rndis: dropping malformed receive buffer of {} bytes: {}",
                    bytes.len(),
                    err
                );
                self.net.input_error();
            }
        }
    }

    fn write_complete(&self, index: usize, result: Result<usize, TransferError>, buffer: TransferBuffer) {
        let mut st = self.gate.lock();
        self.callback_exit(&mut st);

        if matches!(&result, Err(err) if err.is_stop()) {
            debug!("rndis: bulk out {} cancelled", index);
            return;
        }
        if !st.ready_to_transfer {
            return;
        }

        let stalled = match &result {
            Ok(len) => {
                trace!("rndis: bulk out {} done, {} bytes", index, len);
                None
            }
            Err(err) => {
                error!("rndis: bulk out failed: {}", err);
                if *err == TransferError::Stalled {
                    st.session.clone()
                } else {
                    None
                }
            }
        };

        let wake = match st.out_pool.as_mut() {
            Some(pool) => pool.release(index, buffer).unwrap_or_else(|err| {
                error!("rndis: {}", err);
                false
            }),
            None => false,
        };
        drop(st);

        if let Some(session) = stalled {
            if let Err(err) = usb::clear_stall(session.out_pipe(), self.config.stall_clear_attempts) {
                error!("rndis: cannot clear bulk out stall: {}", err);
            }
        }
        if wake {
            self.net.queue_service();
        }
    }
}

/// A bound RNDIS device.
pub struct RndisDriver {
    shared: Arc<Shared>,
}

impl RndisDriver {
    /// Binds to a whole device: picks the first configuration holding an
    /// RNDIS control/data pair, selects it and opens the session.
    pub fn attach(
        device: &dyn UsbDevice,
        net: Arc<dyn NetworkStack>,
        config: DriverConfig,
    ) -> Result<Self> {
        config.validate()?;
        let found = matching::match_device(&device.configurations()).ok_or_else(|| {
            debug!("rndis: no RNDIS function on device");
            Error::ConfigurationMismatch("no RNDIS control/data interface pair")
        })?;
        device
            .set_configuration(found.configuration_value)
            .map_err(|err| {
                error!(
                    "rndis: cannot select configuration {}: {}",
                    found.configuration_value, err
                );
                Error::from(err)
            })?;
        Self::bind(device, found, net, config)
    }

    /// Binds starting from one interface of the already active
    /// configuration.
    pub fn attach_interface(
        device: &dyn UsbDevice,
        configuration: &ConfigurationDescriptor,
        control: &InterfaceDescriptor,
        net: Arc<dyn NetworkStack>,
        config: DriverConfig,
    ) -> Result<Self> {
        config.validate()?;
        let found = matching::match_interface(configuration, control).ok_or(
            Error::ConfigurationMismatch("interface is not an RNDIS control interface"),
        )?;
        Self::bind(device, found, net, config)
    }

    fn bind(
        device: &dyn UsbDevice,
        found: InterfaceMatch,
        net: Arc<dyn NetworkStack>,
        config: DriverConfig,
    ) -> Result<Self> {
        let session = RndisSession::open(device, found, &config)?;
        let mtu = session.info().mtu;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                net,
                mtu_limit: mtu,
                gate: Mutex::new(State {
                    session: Some(Arc::new(session)),
                    enabled: false,
                    ever_enabled: false,
                    transition_in_flight: false,
                    ready_to_transfer: false,
                    data_dead: false,
                    callback_count: 0,
                    out_pool: None,
                    in_buffers: Vec::new(),
                    mtu,
                }),
                transition_done: Condvar::new(),
                callbacks_drained: Condvar::new(),
            }),
        })
    }

    /// Brings the data path up. Calling it on an enabled driver succeeds
    /// without doing anything.
    pub fn enable(&self) -> Result<()> {
        let shared = &self.shared;
        let _transition = shared.begin_transition();

        let session = {
            let mut st = shared.gate.lock();
            if st.enabled {
                debug!("rndis: already enabled");
                return Ok(());
            }
            if st.callback_count != 0 {
                error!(
                    "rndis: {} completions outstanding before enable",
                    st.callback_count
                );
                return Err(Error::InternalInvariantViolation(
                    "transfers outstanding before enable",
                ));
            }
            let Some(session) = st.session.clone() else {
                warn!("rndis: enable after terminate");
                return Err(Error::DeviceDisconnected);
            };
            st.allocate(&shared.config);
            session
        };

        if let Err(err) = session.set_packet_filter(PacketFilter::DEFAULT) {
            error!("rndis: cannot program packet filter: {}", err);
            shared.gate.lock().release_resources();
            return Err(err);
        }

        for (name, pipe) in [("in", session.in_pipe()), ("out", session.out_pipe())] {
            if let Err(err) = usb::clear_stall(pipe, shared.config.stall_clear_attempts) {
                warn!("rndis: cannot clear stale {} pipe stall: {}", name, err);
            }
        }

        if let Err(err) = shared.start_readers(&session) {
            shared.drain(Some(&session));
            return Err(err);
        }

        shared.net.link_status(true);
        shared
            .net
            .queue_set_capacity(shared.config.transmit_queue_capacity);
        shared.net.queue_start();

        let mut st = shared.gate.lock();
        st.enabled = true;
        st.ever_enabled = true;
        info!("rndis: enabled, mtu {}", st.mtu);
        Ok(())
    }

    /// Takes the data path down and waits for every outstanding completion
    /// before freeing buffers. Calling it on a disabled driver succeeds
    /// without doing anything.
    pub fn disable(&self) -> Result<()> {
        let shared = &self.shared;
        let _transition = shared.begin_transition();

        let session = {
            let st = shared.gate.lock();
            if !st.enabled {
                debug!("rndis: already disabled");
                return Ok(());
            }
            st.session.clone()
        };

        shared.stop_queue();
        shared.gate.lock().ready_to_transfer = false;

        if let Some(session) = &session {
            if let Err(err) = session.set_packet_filter(PacketFilter::empty()) {
                warn!("rndis: cannot clear packet filter: {}", err);
            }
        }
        shared.net.link_status(false);

        shared.drain(session.as_deref());

        shared.gate.lock().enabled = false;
        info!("rndis: disabled");
        Ok(())
    }

    /// The device is going away: stop the queue and close both interfaces.
    /// A later [`disable`](Self::disable) still cleans up the data path.
    pub fn terminate(&self) {
        let shared = &self.shared;
        shared.stop_queue();

        let session = {
            let mut st = shared.gate.lock();
            st.ready_to_transfer = false;
            st.session.take()
        };
        if let Some(session) = session {
            info!("rndis: terminating");
            session.close();
        }
    }

    /// Wraps `frame` in an RNDIS packet message and queues it on bulk OUT.
    pub fn transmit(&self, frame: &[u8]) -> Result<TransmitStatus> {
        let shared = &self.shared;
        let mut st = shared.gate.lock();
        let state = &mut *st;

        if !state.ready_to_transfer {
            trace!("rndis: not ready, dropping {} byte frame", frame.len());
            return Ok(TransmitStatus::Dropped);
        }
        let Some(session) = state.session.clone() else {
            return Ok(TransmitStatus::Dropped);
        };

        let max_transfer_size = session.info().max_transfer_size as usize;
        if frame.len() + DATA_HEADER_LEN > max_transfer_size {
            error!(
                "rndis: {} byte frame exceeds max transfer size {}",
                frame.len(),
                max_transfer_size
            );
            drop(st);
            shared.net.output_error();
            return Ok(TransmitStatus::Dropped);
        }

        let pool = state.out_pool.as_mut().ok_or(Error::InternalInvariantViolation(
            "ready to transfer without a transmit pool",
        ))?;
        let Some(mut handle) = pool.reserve()? else {
            debug!("rndis: no transmit buffer free");
            return Ok(TransmitStatus::RetryStall);
        };
        let length = match codec::write_data_frame(&mut handle.buffer, frame) {
            Ok(length) => length,
            Err(err) => {
                pool.restore(handle);
                return Err(err.into());
            }
        };

        let index = handle.index;
        let weak = Arc::downgrade(shared);
        let transfer = Transfer::bulk_out(
            handle.buffer,
            length,
            Box::new(move |result, buffer| {
                if let Some(shared) = weak.upgrade() {
                    shared.write_complete(index, result, buffer);
                }
            }),
        );

        match usb::submit_with_stall_retry(
            session.out_pipe(),
            transfer,
            shared.config.stall_clear_attempts,
        ) {
            Ok(()) => {
                state.callback_count += 1;
                pool.commit(index)?;
                let stall = pool.num_free() == 0;
                trace!("rndis: queued {} byte frame in buffer {}", frame.len(), index);
                drop(st);
                shared.net.output_success();
                Ok(TransmitStatus::Accepted { stall })
            }
            Err(SubmitError { error, transfer }) => {
                pool.restore(BufferHandle {
                    index,
                    buffer: transfer.buffer,
                });
                drop(st);
                if error.is_stop() {
                    debug!("rndis: bulk out gone, dropping frame");
                } else {
                    error!("rndis: bulk out submit failed: {}", error);
                    shared.net.output_error();
                }
                Ok(TransmitStatus::Dropped)
            }
        }
    }

    pub fn hardware_address(&self) -> Result<EthernetAddress> {
        let session = self.session().ok_or(Error::DeviceDisconnected)?;
        session.hardware_address()
    }

    pub fn mtu(&self) -> u32 {
        self.shared.gate.lock().mtu
    }

    /// Largest MTU the device's transfer size allows.
    pub fn max_mtu(&self) -> u32 {
        self.shared.mtu_limit
    }

    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        if mtu > self.shared.mtu_limit {
            warn!(
                "rndis: refusing mtu {} above {}",
                mtu, self.shared.mtu_limit
            );
            return Err(Error::ConfigurationMismatch(
                "mtu larger than the device transfer size allows",
            ));
        }
        self.shared.gate.lock().mtu = mtu;
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        let st = self.shared.gate.lock();
        if st.transition_in_flight {
            LifecycleState::Transitioning
        } else if st.enabled {
            LifecycleState::Enabled
        } else if st.ever_enabled {
            LifecycleState::Disabled
        } else {
            LifecycleState::Inactive
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.gate.lock().ready_to_transfer
    }

    /// Set once the bulk IN loop could not be restarted. Only a
    /// disable/enable cycle clears it.
    pub fn data_path_dead(&self) -> bool {
        self.shared.gate.lock().data_dead
    }

    pub fn outstanding_callbacks(&self) -> usize {
        self.shared.gate.lock().callback_count
    }

    /// Free transmit buffers, or `None` while no pool is allocated.
    pub fn free_out_buffers(&self) -> Option<usize> {
        self.shared
            .gate
            .lock()
            .out_pool
            .as_ref()
            .map(BufferPool::num_free)
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session().map(|session| *session.info())
    }

    fn session(&self) -> Option<Arc<RndisSession>> {
        self.shared.gate.lock().session.clone()
    }
}
