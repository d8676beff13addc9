//! Stream sublayer: typed message channels multiplexed inside a connection.
//! Application messages are fragmented into STREAM packets; reliable streams
//! ack complete messages, ordered streams hold back out-of-order completions.

use crate::net::wire::{read_varint, write_varint, VARINT_MAX_OCTETS};
use crate::shared::{ErrorType, NetworkError, NetworkResult};
use crate::StreamId;
use byteorder::{ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::io::Cursor;
use std::time::Instant;

/// Hard cap on fragments per message.
pub const MAX_FRAGMENTS: u32 = 65_535;

/// Recommended cap on simultaneous streams per connection.
pub const DEFAULT_MAX_STREAMS: u32 = 65_535;

/// Worst-case stream frame header: sub code plus four maximal varints.
pub const HEADER_MAX: usize = 1 + 4 * VARINT_MAX_OCTETS;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamKind {
    ReliableOrdered,
    ReliableUnordered,
    UnreliableOrdered,
    UnreliableUnordered,
}

impl StreamKind {
    #[inline]
    pub fn from_flags(reliable: bool, ordered: bool) -> StreamKind {
        match (reliable, ordered) {
            (true, true) => StreamKind::ReliableOrdered,
            (true, false) => StreamKind::ReliableUnordered,
            (false, true) => StreamKind::UnreliableOrdered,
            (false, false) => StreamKind::UnreliableUnordered,
        }
    }

    #[inline]
    pub fn reliable(self) -> bool {
        match self {
            StreamKind::ReliableOrdered | StreamKind::ReliableUnordered => true,
            _ => false,
        }
    }

    #[inline]
    pub fn ordered(self) -> bool {
        match self {
            StreamKind::ReliableOrdered | StreamKind::UnreliableOrdered => true,
            _ => false,
        }
    }

    #[inline]
    pub fn flags(self) -> u8 {
        (self.reliable() as u8) | ((self.ordered() as u8) << 1)
    }

    #[inline]
    pub fn from_wire_flags(flags: u8) -> StreamKind {
        StreamKind::from_flags(flags & 0x01 != 0, flags & 0x02 != 0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Sub {
    Data = 0,
    DataValidate = 1,
    DataReceived = 2,
    Backpressure = 3,
    BackpressureConfirm = 4,
    Close = 5,
    CloseConfirm = 6,
    Reconfigure = 7,
    ReconfigureConfirm = 8,
}

impl Sub {
    fn from_u8(value: u8) -> Option<Sub> {
        match value {
            0 => Some(Sub::Data),
            1 => Some(Sub::DataValidate),
            2 => Some(Sub::DataReceived),
            3 => Some(Sub::Backpressure),
            4 => Some(Sub::BackpressureConfirm),
            5 => Some(Sub::Close),
            6 => Some(Sub::CloseConfirm),
            7 => Some(Sub::Reconfigure),
            8 => Some(Sub::ReconfigureConfirm),
            _ => None,
        }
    }
}

/// One decoded stream frame, the plaintext of a STREAM packet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamFrame {
    Data {
        stream: StreamId,
        message: u32,
        fragment: u32,
        total: u32,
        validate: bool,
        bytes: Vec<u8>,
    },
    DataReceived {
        stream: StreamId,
        message: u32,
    },
    Backpressure {
        stream: StreamId,
        on: bool,
    },
    BackpressureConfirm {
        stream: StreamId,
        on: bool,
    },
    Close {
        stream: StreamId,
    },
    CloseConfirm {
        stream: StreamId,
    },
    Reconfigure {
        stream: StreamId,
        kind: StreamKind,
    },
    ReconfigureConfirm {
        stream: StreamId,
        kind: StreamKind,
    },
}

impl StreamFrame {
    #[inline]
    pub fn stream(&self) -> StreamId {
        match *self {
            StreamFrame::Data { stream, .. }
            | StreamFrame::DataReceived { stream, .. }
            | StreamFrame::Backpressure { stream, .. }
            | StreamFrame::BackpressureConfirm { stream, .. }
            | StreamFrame::Close { stream }
            | StreamFrame::CloseConfirm { stream }
            | StreamFrame::Reconfigure { stream, .. }
            | StreamFrame::ReconfigureConfirm { stream, .. } => stream,
        }
    }

    /// Reliable data frames consume currency and get acknowledged.
    #[inline]
    pub fn is_data(&self) -> bool {
        match self {
            StreamFrame::Data { .. } => true,
            _ => false,
        }
    }

    pub fn read(buf: &[u8]) -> NetworkResult<StreamFrame> {
        let mut stream = Cursor::new(buf);
        let sub = Sub::from_u8(stream.read_u8()?)
            .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;

        let mut at = stream.position() as usize;
        let mut next_varint = || -> NetworkResult<u32> {
            let (value, len) = read_varint(&buf[at..], VARINT_MAX_OCTETS)
                .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;
            at += len;
            Ok(value)
        };

        let id = next_varint()?;

        let frame = match sub {
            Sub::Data | Sub::DataValidate => {
                let message = next_varint()?;
                let fragment = next_varint()?;
                let total = next_varint()?;

                if total == 0 || fragment >= total || total > MAX_FRAGMENTS {
                    return Err(NetworkError::Fatal(ErrorType::MalformedPacket));
                }

                StreamFrame::Data {
                    stream: id,
                    message,
                    fragment,
                    total,
                    validate: sub == Sub::DataValidate,
                    bytes: buf[at..].to_vec(),
                }
            }
            Sub::DataReceived => StreamFrame::DataReceived {
                stream: id,
                message: next_varint()?,
            },
            Sub::Backpressure | Sub::BackpressureConfirm => {
                let on = buf
                    .get(at)
                    .copied()
                    .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?
                    != 0;

                match sub {
                    Sub::Backpressure => StreamFrame::Backpressure { stream: id, on },
                    _ => StreamFrame::BackpressureConfirm { stream: id, on },
                }
            }
            Sub::Close => StreamFrame::Close { stream: id },
            Sub::CloseConfirm => StreamFrame::CloseConfirm { stream: id },
            Sub::Reconfigure | Sub::ReconfigureConfirm => {
                let flags = buf
                    .get(at)
                    .copied()
                    .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;
                let kind = StreamKind::from_wire_flags(flags);

                match sub {
                    Sub::Reconfigure => StreamFrame::Reconfigure { stream: id, kind },
                    _ => StreamFrame::ReconfigureConfirm { stream: id, kind },
                }
            }
        };

        Ok(frame)
    }

    pub fn write(&self, out: &mut Vec<u8>) -> NetworkResult<()> {
        let mut varint = |out: &mut Vec<u8>, value: u32| -> NetworkResult<()> {
            if write_varint(&mut *out, value, VARINT_MAX_OCTETS) == 0 {
                return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
            }
            Ok(())
        };

        match self {
            StreamFrame::Data {
                stream,
                message,
                fragment,
                total,
                validate,
                bytes,
            } => {
                out.write_u8(if *validate {
                    Sub::DataValidate as u8
                } else {
                    Sub::Data as u8
                })?;
                varint(out, *stream)?;
                varint(out, *message)?;
                varint(out, *fragment)?;
                varint(out, *total)?;
                out.extend_from_slice(bytes);
            }
            StreamFrame::DataReceived { stream, message } => {
                out.write_u8(Sub::DataReceived as u8)?;
                varint(out, *stream)?;
                varint(out, *message)?;
            }
            StreamFrame::Backpressure { stream, on } => {
                out.write_u8(Sub::Backpressure as u8)?;
                varint(out, *stream)?;
                out.write_u8(*on as u8)?;
            }
            StreamFrame::BackpressureConfirm { stream, on } => {
                out.write_u8(Sub::BackpressureConfirm as u8)?;
                varint(out, *stream)?;
                out.write_u8(*on as u8)?;
            }
            StreamFrame::Close { stream } => {
                out.write_u8(Sub::Close as u8)?;
                varint(out, *stream)?;
            }
            StreamFrame::CloseConfirm { stream } => {
                out.write_u8(Sub::CloseConfirm as u8)?;
                varint(out, *stream)?;
            }
            StreamFrame::Reconfigure { stream, kind } => {
                out.write_u8(Sub::Reconfigure as u8)?;
                varint(out, *stream)?;
                out.write_u8(kind.flags())?;
            }
            StreamFrame::ReconfigureConfirm { stream, kind } => {
                out.write_u8(Sub::ReconfigureConfirm as u8)?;
                varint(out, *stream)?;
                out.write_u8(kind.flags())?;
            }
        }

        Ok(())
    }
}

/// What a stream reports back to its connection after consuming a frame.
#[derive(Debug, Eq, PartialEq)]
pub enum StreamEvent {
    /// A complete application message, in delivery order for ordered kinds.
    Message(Vec<u8>),
    /// The peer acknowledged a message; refund this many reliable packets.
    Acked(u32),
    /// Both sides agreed to close; the connection should drop the stream.
    Closed,
}

struct OutgoingMessage {
    message: u32,
    fragments: Vec<Vec<u8>>,
    next_fragment: usize,
    sent_at: Instant,
    awaiting_ack: bool,
}

struct Reassembly {
    total: u32,
    fragments: HashMap<u32, Vec<u8>>,
}

impl Reassembly {
    fn complete(&self) -> bool {
        self.fragments.len() as u32 == self.total
    }

    fn assemble(mut self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for index in 0..self.total {
            bytes.extend_from_slice(&self.fragments.remove(&index).expect("fragment accounted"));
        }
        bytes
    }
}

/// One directional message channel inside a connection.
pub struct Stream {
    id: StreamId,
    kind: StreamKind,
    umtu: usize,

    next_message: u32,
    outgoing: VecDeque<OutgoingMessage>,
    control: VecDeque<StreamFrame>,

    reassembly: HashMap<u32, Reassembly>,
    ready: HashMap<u32, Vec<u8>>,
    next_deliver: u32,

    peer_paused: bool,
    local_paused: bool,
    close_sent: bool,
    close_received: bool,
}

impl Stream {
    pub fn new(id: StreamId, kind: StreamKind, umtu: usize) -> Stream {
        Stream {
            id,
            kind,
            umtu,
            next_message: 0,
            outgoing: VecDeque::new(),
            control: VecDeque::new(),
            reassembly: HashMap::new(),
            ready: HashMap::new(),
            next_deliver: 0,
            peer_paused: false,
            local_paused: false,
            close_sent: false,
            close_received: false,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    #[inline]
    pub fn closing(&self) -> bool {
        self.close_sent || self.close_received
    }

    /// True while unsent or unacknowledged data is buffered.
    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.outgoing.is_empty() || !self.control.is_empty()
    }

    /// Queues an application message, fragmenting it to the stream's UMTU.
    pub fn send(&mut self, bytes: &[u8], now: Instant) -> NetworkResult<u32> {
        if self.closing() {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        if self.peer_paused {
            return Err(NetworkError::Wait);
        }

        let total = (bytes.len().max(1) + self.umtu - 1) / self.umtu;
        if total as u32 > MAX_FRAGMENTS {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let fragments = if bytes.is_empty() {
            vec![Vec::new()]
        } else {
            bytes.chunks(self.umtu).map(<[u8]>::to_vec).collect()
        };

        let message = self.next_message;
        self.next_message = self.next_message.wrapping_add(1);

        self.outgoing.push_back(OutgoingMessage {
            message,
            fragments,
            next_fragment: 0,
            sent_at: now,
            awaiting_ack: false,
        });

        Ok(message)
    }

    /// Requests the peer to pause or resume sending.
    pub fn set_backpressure(&mut self, on: bool) {
        self.local_paused = on;
        self.control.push_back(StreamFrame::Backpressure { stream: self.id, on });
    }

    /// Starts the close exchange.
    pub fn close(&mut self) {
        if !self.close_sent {
            self.close_sent = true;
            self.control.push_back(StreamFrame::Close { stream: self.id });
        }
    }

    /// Renegotiates the stream type in place.
    pub fn reconfigure(&mut self, kind: StreamKind) {
        self.kind = kind;
        self.control
            .push_back(StreamFrame::Reconfigure { stream: self.id, kind });
    }

    /// The next frame to put on the wire, if any. Control frames go first;
    /// data frames follow while `allow_data` holds (the connection drops the
    /// gate when currency runs out), resending unacknowledged reliable
    /// messages once `resend_after` has elapsed since their last transmission.
    pub fn poll_frame(
        &mut self,
        now: Instant,
        resend_after: std::time::Duration,
        allow_data: bool,
    ) -> Option<StreamFrame> {
        if let Some(frame) = self.control.pop_front() {
            return Some(frame);
        }

        if !allow_data {
            return None;
        }

        let reliable = self.kind.reliable();
        let id = self.id;

        for pending in self.outgoing.iter_mut() {
            if pending.awaiting_ack {
                if reliable && now.duration_since(pending.sent_at) >= resend_after {
                    // Resend the whole message from the first fragment.
                    pending.next_fragment = 0;
                    pending.awaiting_ack = false;
                    pending.sent_at = now;
                } else {
                    continue;
                }
            }

            let index = pending.next_fragment;
            let total = pending.fragments.len() as u32;
            let last = index + 1 == pending.fragments.len();

            let frame = StreamFrame::Data {
                stream: id,
                message: pending.message,
                fragment: index as u32,
                total,
                validate: reliable && last,
                bytes: pending.fragments[index].clone(),
            };

            pending.next_fragment += 1;
            pending.sent_at = now;

            if last {
                pending.awaiting_ack = true;
            }

            return Some(frame);
        }

        // Unreliable messages are fire-and-forget: drop them once fully sent.
        if !reliable {
            self.outgoing.retain(|pending| !pending.awaiting_ack);
        }

        None
    }

    /// Consumes an inbound frame, queueing replies on the control queue and
    /// returning delivery events.
    pub fn handle_frame(&mut self, frame: StreamFrame) -> NetworkResult<Vec<StreamEvent>> {
        let mut events = Vec::new();

        match frame {
            StreamFrame::Data {
                message,
                fragment,
                total,
                validate,
                bytes,
                ..
            } => {
                if self.kind.ordered() && message < self.next_deliver {
                    // Stale for ordered delivery; reliable peers still need
                    // their ack or they will resend forever.
                    if validate {
                        self.control
                            .push_back(StreamFrame::DataReceived { stream: self.id, message });
                    }
                    return Ok(events);
                }

                let entry = self
                    .reassembly
                    .entry(message)
                    .or_insert_with(|| Reassembly { total, fragments: HashMap::new() });

                if entry.total != total || fragment >= total {
                    return Err(NetworkError::Fatal(ErrorType::MalformedPacket));
                }

                entry.fragments.insert(fragment, bytes);

                if entry.complete() {
                    let assembled = self
                        .reassembly
                        .remove(&message)
                        .expect("reassembly entry present")
                        .assemble();

                    if validate {
                        self.control
                            .push_back(StreamFrame::DataReceived { stream: self.id, message });
                    }

                    self.deliver(message, assembled, &mut events);
                }
            }
            StreamFrame::DataReceived { message, .. } => {
                let before = self.outgoing.len();
                let mut acked_packets = 0u32;

                self.outgoing.retain(|pending| {
                    if pending.message == message {
                        acked_packets += pending.fragments.len() as u32;
                        false
                    } else {
                        true
                    }
                });

                if self.outgoing.len() != before {
                    events.push(StreamEvent::Acked(acked_packets));
                }
            }
            StreamFrame::Backpressure { on, .. } => {
                self.peer_paused = on;
                self.control
                    .push_back(StreamFrame::BackpressureConfirm { stream: self.id, on });
            }
            StreamFrame::BackpressureConfirm { .. } => (),
            StreamFrame::Close { .. } => {
                self.close_received = true;
                self.control
                    .push_back(StreamFrame::CloseConfirm { stream: self.id });
                events.push(StreamEvent::Closed);
            }
            StreamFrame::CloseConfirm { .. } => {
                if self.close_sent {
                    events.push(StreamEvent::Closed);
                }
            }
            StreamFrame::Reconfigure { kind, .. } => {
                self.kind = kind;
                self.control
                    .push_back(StreamFrame::ReconfigureConfirm { stream: self.id, kind });
            }
            StreamFrame::ReconfigureConfirm { .. } => (),
        }

        Ok(events)
    }

    fn deliver(&mut self, message: u32, bytes: Vec<u8>, events: &mut Vec<StreamEvent>) {
        if !self.kind.ordered() {
            events.push(StreamEvent::Message(bytes));
            return;
        }

        if self.kind.reliable() {
            // Hold back until the gap closes.
            self.ready.insert(message, bytes);

            while let Some(bytes) = self.ready.remove(&self.next_deliver) {
                events.push(StreamEvent::Message(bytes));
                self.next_deliver = self.next_deliver.wrapping_add(1);
            }
        } else {
            // Latest wins: anything older than this message is forfeit.
            self.next_deliver = message.wrapping_add(1);
            self.reassembly.retain(|&id, _| id >= message);
            events.push(StreamEvent::Message(bytes));
        }
    }
}
