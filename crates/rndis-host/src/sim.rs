//! In-memory USB device and network stack for driving the engine in tests.
//!
//! The device answers RNDIS commands the way a tethering phone does. Bulk
//! transfers sit in per-pipe queues until the test completes them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::net::NetworkStack;
use crate::protocol::{MessageType, Oid, Status};
use crate::usb::{
    ConfigurationDescriptor, DeviceRequest, EndpointDescriptor, InterfaceDescriptor,
    InterfaceEntry, SubmitError, Transfer, TransferError, UsbDevice, UsbInterface, UsbPipe,
};

pub const SIM_MAC: [u8; 6] = [0x02, 0x1a, 0x11, 0xf0, 0x00, 0x42];

pub const BULK_IN: u8 = 0x81;
pub const BULK_OUT: u8 = 0x02;

fn words(values: &[u32]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * 4];
    LittleEndian::write_u32_into(values, &mut out);
    out
}

fn bulk(address: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        attributes: 2,
        max_packet_size: 512,
        interval: 0,
    }
}

/// Extra messages to put in front of the next command's completion.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The right completion type carrying somebody else's request id.
    StaleId,
    Indicate(Status),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct SentCommand {
    pub request: DeviceRequest,
    pub data: Vec<u8>,
}

struct Responder {
    max_transfer_size: u32,
    status: Status,
    silent: bool,
    mac_len: usize,
    injected: VecDeque<Reply>,
    replies: VecDeque<Vec<u8>>,
    sent: Vec<SentCommand>,
    polls: usize,
}

impl Responder {
    fn answer(&self, msg: &[u8]) -> Option<Vec<u8>> {
        if msg.len() < 12 {
            return None;
        }
        let kind = MessageType(LittleEndian::read_u32(&msg[0..4]));
        let id = LittleEndian::read_u32(&msg[8..12]);
        let status = self.status.0;

        match kind {
            MessageType::INIT => Some(words(&[
                MessageType::INIT_COMPLETE.0,
                52,
                id,
                status,
                1,
                0,
                1,
                0,
                1,
                self.max_transfer_size,
                0,
                0,
                0,
            ])),
            MessageType::QUERY => {
                let oid = LittleEndian::read_u32(&msg[12..16]);
                let payload = if oid == Oid::OID_802_3_PERMANENT_ADDRESS.value() {
                    let mut mac = SIM_MAC.to_vec();
                    mac.resize(self.mac_len, 0);
                    mac
                } else if oid == Oid::OID_GEN_MAXIMUM_FRAME_SIZE.value() {
                    1500u32.to_le_bytes().to_vec()
                } else {
                    Vec::new()
                };
                let mut reply = words(&[
                    MessageType::QUERY_COMPLETE.0,
                    24 + payload.len() as u32,
                    id,
                    status,
                    payload.len() as u32,
                    16,
                ]);
                reply.extend(payload);
                Some(reply)
            }
            MessageType::SET => Some(words(&[MessageType::SET_COMPLETE.0, 16, id, status])),
            _ => None,
        }
    }
}

#[derive(Default)]
struct DeviceLog {
    open: Mutex<Vec<u8>>,
    closed: Mutex<Vec<u8>>,
}

pub struct SimInterface {
    descriptor: InterfaceDescriptor,
    endpoints: Mutex<Vec<EndpointDescriptor>>,
    pipes: Mutex<Vec<Arc<SimPipe>>>,
    rndis: Mutex<Responder>,
    closed: AtomicBool,
    log: Option<Arc<DeviceLog>>,
    set_hold: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl SimInterface {
    fn new(
        number: u8,
        triple: (u8, u8, u8),
        endpoints: Vec<EndpointDescriptor>,
        log: Option<Arc<DeviceLog>>,
    ) -> Self {
        Self {
            descriptor: InterfaceDescriptor {
                number,
                alternate_setting: 0,
                endpoint_count: endpoints.len() as u8,
                class: triple.0,
                subclass: triple.1,
                protocol: triple.2,
            },
            endpoints: Mutex::new(endpoints),
            pipes: Mutex::new(Vec::new()),
            rndis: Mutex::new(Responder {
                max_transfer_size: 16384,
                status: Status::SUCCESS,
                silent: false,
                mac_len: 6,
                injected: VecDeque::new(),
                replies: VecDeque::new(),
                sent: Vec::new(),
                polls: 0,
            }),
            closed: AtomicBool::new(false),
            log,
            set_hold: Mutex::new(None),
        }
    }

    /// A standalone Android RNDIS control interface.
    pub fn rndis_control(number: u8) -> Arc<Self> {
        Arc::new(Self::new(number, (224, 1, 3), Vec::new(), None))
    }

    pub fn push_reply(&self, reply: Reply) {
        self.rndis.lock().injected.push_back(reply);
    }

    pub fn set_silent(&self, silent: bool) {
        self.rndis.lock().silent = silent;
    }

    pub fn set_status(&self, status: Status) {
        self.rndis.lock().status = status;
    }

    pub fn set_mac_len(&self, len: usize) {
        self.rndis.lock().mac_len = len;
    }

    pub fn set_max_transfer_size(&self, size: u32) {
        self.rndis.lock().max_transfer_size = size;
    }

    pub fn set_extra_endpoint(&self) {
        self.endpoints.lock().push(EndpointDescriptor {
            address: 0x83,
            attributes: 3,
            max_packet_size: 8,
            interval: 9,
        });
    }

    pub fn polls(&self) -> usize {
        self.rndis.lock().polls
    }

    pub fn sent_commands(&self) -> Vec<SentCommand> {
        self.rndis.lock().sent.clone()
    }

    /// Packet filter values of every SET that went out, in order.
    pub fn packet_filters(&self) -> Vec<u32> {
        self.sent_commands()
            .iter()
            .filter(|cmd| {
                LittleEndian::read_u32(&cmd.data[0..4]) == MessageType::SET.0
                    && LittleEndian::read_u32(&cmd.data[12..16])
                        == Oid::OID_GEN_CURRENT_PACKET_FILTER.value()
            })
            .map(|cmd| LittleEndian::read_u32(&cmd.data[28..32]))
            .collect()
    }

    /// Makes the next SET block inside the control transfer. The first
    /// receiver fires once the SET is stuck; sending on the returned sender
    /// lets it through.
    pub fn hold_next_set(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.set_hold.lock() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    pub fn pipe(&self, address: u8) -> Option<Arc<SimPipe>> {
        self.pipes
            .lock()
            .iter()
            .find(|pipe| pipe.address == address)
            .cloned()
    }

    /// Pulls the plug without going through the driver.
    pub fn close_now(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl UsbInterface for SimInterface {
    fn descriptor(&self) -> InterfaceDescriptor {
        self.descriptor
    }

    fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.endpoints.lock().clone()
    }

    fn open_pipe(&self, endpoint: &EndpointDescriptor) -> Result<Arc<dyn UsbPipe>, TransferError> {
        let pipe = Arc::new(SimPipe::new(endpoint.address));
        self.pipes.lock().push(Arc::clone(&pipe));
        Ok(pipe)
    }

    fn control_out(&self, request: DeviceRequest, data: &[u8]) -> Result<usize, TransferError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransferError::NotResponding);
        }
        self.rndis.lock().sent.push(SentCommand {
            request,
            data: data.to_vec(),
        });

        let is_set = data.len() >= 4 && LittleEndian::read_u32(&data[0..4]) == MessageType::SET.0;
        if is_set {
            let hold = self.set_hold.lock().take();
            if let Some((entered, release)) = hold {
                let _ = entered.send(());
                let _ = release.recv();
            }
        }

        let mut rndis = self.rndis.lock();
        let answer = rndis.answer(data);
        while let Some(extra) = rndis.injected.pop_front() {
            let bytes = match extra {
                Reply::StaleId => match &answer {
                    Some(real) => {
                        let mut stale = real.clone();
                        let id = LittleEndian::read_u32(&stale[8..12]);
                        LittleEndian::write_u32(&mut stale[8..12], id.wrapping_add(1000));
                        stale
                    }
                    None => continue,
                },
                Reply::Indicate(status) => words(&[
                    MessageType::INDICATE_STATUS.0,
                    20,
                    status.0,
                    0,
                    0,
                ]),
                Reply::Raw(bytes) => bytes,
            };
            rndis.replies.push_back(bytes);
        }
        if let Some(answer) = answer {
            if !rndis.silent {
                rndis.replies.push_back(answer);
            }
        }
        Ok(data.len())
    }

    fn control_in(&self, _request: DeviceRequest, data: &mut [u8]) -> Result<usize, TransferError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransferError::NotResponding);
        }
        let mut rndis = self.rndis.lock();
        rndis.polls += 1;
        match rndis.replies.pop_front() {
            Some(reply) => {
                let len = reply.len().min(data.len());
                data[..len].copy_from_slice(&reply[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pipes = self.pipes.lock().clone();
        for pipe in pipes {
            pipe.close();
        }
        if let Some(log) = &self.log {
            log.open.lock().retain(|n| *n != self.descriptor.number);
            log.closed.lock().push(self.descriptor.number);
        }
    }
}

pub struct SimPipe {
    pub address: u8,
    pending: Mutex<VecDeque<Transfer>>,
    written: Mutex<Vec<Vec<u8>>>,
    submits: AtomicUsize,
    stall_submits: AtomicUsize,
    refuse: Mutex<Option<TransferError>>,
    clear_stalls: AtomicUsize,
    aborts: AtomicUsize,
    defer_abort: AtomicBool,
    closed: AtomicBool,
}

impl SimPipe {
    fn new(address: u8) -> Self {
        Self {
            address,
            pending: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            submits: AtomicUsize::new(0),
            stall_submits: AtomicUsize::new(0),
            refuse: Mutex::new(None),
            clear_stalls: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            defer_abort: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn take_next(&self) -> Option<Transfer> {
        self.pending.lock().pop_front()
    }

    /// Finishes the oldest IN transfer with `data`.
    pub fn complete_in(&self, data: &[u8]) -> bool {
        let Some(mut transfer) = self.take_next() else {
            return false;
        };
        let len = data.len().min(transfer.buffer.len());
        transfer.buffer[..len].copy_from_slice(&data[..len]);
        transfer.complete(Ok(len));
        true
    }

    /// Finishes the oldest OUT transfer as fully sent.
    pub fn complete_out(&self) -> bool {
        let Some(transfer) = self.take_next() else {
            return false;
        };
        let len = transfer.length;
        transfer.complete(Ok(len));
        true
    }

    pub fn fail_next(&self, err: TransferError) -> bool {
        let Some(transfer) = self.take_next() else {
            return false;
        };
        transfer.complete(Err(err));
        true
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn clear_stalls(&self) -> usize {
        self.clear_stalls.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn stall_next_submits(&self, count: usize) {
        self.stall_submits.store(count, Ordering::SeqCst);
    }

    pub fn refuse_submits(&self, err: Option<TransferError>) {
        *self.refuse.lock() = err;
    }

    /// Abort leaves pending transfers alone; the test finishes them later.
    pub fn defer_abort(&self, defer: bool) {
        self.defer_abort.store(defer, Ordering::SeqCst);
    }

    fn cancel_all(&self) {
        let drained: Vec<Transfer> = self.pending.lock().drain(..).collect();
        for transfer in drained {
            transfer.complete(Err(TransferError::Aborted));
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all();
    }
}

impl UsbPipe for SimPipe {
    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError {
                error: TransferError::NotResponding,
                transfer,
            });
        }
        let stalls = self.stall_submits.load(Ordering::SeqCst);
        if stalls > 0 {
            self.stall_submits.store(stalls - 1, Ordering::SeqCst);
            return Err(SubmitError {
                error: TransferError::Stalled,
                transfer,
            });
        }
        if let Some(error) = *self.refuse.lock() {
            return Err(SubmitError { error, transfer });
        }

        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.address & EndpointDescriptor::DIRECTION_IN == 0 {
            self.written
                .lock()
                .push(transfer.buffer[..transfer.length].to_vec());
        }
        self.pending.lock().push_back(transfer);
        Ok(())
    }

    fn clear_stall(&self) -> Result<(), TransferError> {
        self.clear_stalls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        if !self.defer_abort.load(Ordering::SeqCst) {
            self.cancel_all();
        }
    }
}

pub struct SimDevice {
    configs: Vec<ConfigurationDescriptor>,
    interfaces: Vec<Arc<SimInterface>>,
    log: Arc<DeviceLog>,
    fail_open: Mutex<Vec<u8>>,
    selected: Mutex<Option<u8>>,
    control_number: u8,
}

impl SimDevice {
    /// A phone in tethering mode: `control_number` mass-storage style
    /// interfaces, then the RNDIS control interface and its data interface.
    pub fn android_phone(control_number: u8, max_transfer_size: u32) -> Arc<Self> {
        let log = Arc::new(DeviceLog::default());
        let mut interfaces = Vec::new();

        for number in 0..control_number {
            interfaces.push(Arc::new(SimInterface::new(
                number,
                (8, 6, 0x50),
                vec![bulk(0x84), bulk(0x05)],
                Some(Arc::clone(&log)),
            )));
        }
        let control = SimInterface::new(
            control_number,
            (224, 1, 3),
            vec![EndpointDescriptor {
                address: 0x83,
                attributes: 3,
                max_packet_size: 8,
                interval: 9,
            }],
            Some(Arc::clone(&log)),
        );
        control.set_max_transfer_size(max_transfer_size);
        interfaces.push(Arc::new(control));
        interfaces.push(Arc::new(SimInterface::new(
            control_number + 1,
            (10, 0, 0),
            vec![bulk(BULK_IN), bulk(BULK_OUT)],
            Some(Arc::clone(&log)),
        )));

        let configs = vec![ConfigurationDescriptor {
            value: 1,
            interfaces: interfaces
                .iter()
                .map(|iface| InterfaceEntry {
                    descriptor: iface.descriptor,
                    endpoints: iface.endpoints(),
                })
                .collect(),
        }];

        Arc::new(Self {
            configs,
            interfaces,
            log,
            fail_open: Mutex::new(Vec::new()),
            selected: Mutex::new(None),
            control_number,
        })
    }

    pub fn control_interface(&self) -> Arc<SimInterface> {
        Arc::clone(&self.interfaces[usize::from(self.control_number)])
    }

    pub fn data_interface(&self) -> Arc<SimInterface> {
        Arc::clone(&self.interfaces[usize::from(self.control_number) + 1])
    }

    pub fn in_pipe(&self) -> Arc<SimPipe> {
        self.data_interface()
            .pipe(BULK_IN)
            .expect("bulk in pipe not opened")
    }

    pub fn out_pipe(&self) -> Arc<SimPipe> {
        self.data_interface()
            .pipe(BULK_OUT)
            .expect("bulk out pipe not opened")
    }

    pub fn fail_open(&self, number: u8) {
        self.fail_open.lock().push(number);
    }

    pub fn open_interfaces(&self) -> Vec<u8> {
        let mut open = self.log.open.lock().clone();
        open.sort_unstable();
        open
    }

    pub fn close_log(&self) -> Vec<u8> {
        self.log.closed.lock().clone()
    }

    pub fn selected_configuration(&self) -> Option<u8> {
        *self.selected.lock()
    }
}

impl UsbDevice for SimDevice {
    fn configurations(&self) -> Vec<ConfigurationDescriptor> {
        self.configs.clone()
    }

    fn set_configuration(&self, value: u8) -> Result<(), TransferError> {
        *self.selected.lock() = Some(value);
        Ok(())
    }

    fn open_interface(&self, number: u8) -> Result<Arc<dyn UsbInterface>, TransferError> {
        if self.fail_open.lock().contains(&number) {
            return Err(TransferError::NotResponding);
        }
        let iface = self
            .interfaces
            .iter()
            .find(|iface| iface.descriptor.number == number)
            .ok_or(TransferError::Other(-1))?;
        iface.closed.store(false, Ordering::SeqCst);
        self.log.open.lock().push(number);
        Ok(Arc::clone(iface) as Arc<dyn UsbInterface>)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    Link(bool),
    QueueStart,
    QueueStop,
    QueueFlush,
    QueueCapacity(usize),
    QueueService,
}

#[derive(Default)]
pub struct SimNet {
    frames: Mutex<Vec<Vec<u8>>>,
    events: Mutex<Vec<NetEvent>>,
    output_ok: AtomicUsize,
    output_err: AtomicUsize,
    input_ok: AtomicUsize,
    input_err: AtomicUsize,
}

impl SimNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub fn events(&self) -> Vec<NetEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: NetEvent) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }

    pub fn output_ok(&self) -> usize {
        self.output_ok.load(Ordering::SeqCst)
    }

    pub fn output_errors(&self) -> usize {
        self.output_err.load(Ordering::SeqCst)
    }

    pub fn input_ok(&self) -> usize {
        self.input_ok.load(Ordering::SeqCst)
    }

    pub fn input_errors(&self) -> usize {
        self.input_err.load(Ordering::SeqCst)
    }

    fn push(&self, event: NetEvent) {
        self.events.lock().push(event);
    }
}

impl NetworkStack for SimNet {
    fn frame_received(&self, frame: &[u8]) {
        self.frames.lock().push(frame.to_vec());
    }

    fn output_success(&self) {
        self.output_ok.fetch_add(1, Ordering::SeqCst);
    }

    fn output_error(&self) {
        self.output_err.fetch_add(1, Ordering::SeqCst);
    }

    fn input_success(&self) {
        self.input_ok.fetch_add(1, Ordering::SeqCst);
    }

    fn input_error(&self) {
        self.input_err.fetch_add(1, Ordering::SeqCst);
    }

    fn queue_start(&self) {
        self.push(NetEvent::QueueStart);
    }

    fn queue_stop(&self) {
        self.push(NetEvent::QueueStop);
    }

    fn queue_flush(&self) {
        self.push(NetEvent::QueueFlush);
    }

    fn queue_set_capacity(&self, capacity: usize) {
        self.push(NetEvent::QueueCapacity(capacity));
    }

    fn queue_service(&self) {
        self.push(NetEvent::QueueService);
    }

    fn link_status(&self, up: bool) {
        self.push(NetEvent::Link(up));
    }
}
