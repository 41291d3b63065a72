use log::trace;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::time::Duration;

use crate::circuit::{Circuit, WireId};
use crate::constants::{CONNECT_RETRIES, CONNECT_RETRY_DELAY_MS, MAX_FRAME_BYTES};
use crate::error::{Error, Result};
use crate::garbler::{EncodedInput, GarbledTable};
use crate::group::PrimeGroup;

/// Sizes both parties agree on during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lengths {
    /// Number of integers each party contributes.
    pub input_length: usize,
    /// Bit width of each integer.
    pub bit_length: usize,
}

/// Every message exchanged between the two parties.
///
/// Serde + length-prefixed bincode frames give both peers an explicit,
/// language-independent schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Phase-1 request carrying the garbler's scaled sizes.
    Negotiate {
        /// Sizes the garbler proposes.
        preliminary_data: Lengths,
    },
    /// Phase-1 reply with the adopted sizes.
    NegotiateReply(Lengths),
    /// Phase-3 circuit transmission.
    CircuitPackage {
        /// Circuit topology.
        circuit: Circuit,
        /// Encrypted truth tables keyed by gate id.
        garbled_tables: HashMap<WireId, GarbledTable>,
        /// Permutation bits of the output wires.
        pbits_out: HashMap<WireId, u8>,
    },
    /// Plain acknowledgement.
    Ack(bool),
    /// Phase-4 garbler input map.
    GarblerInputs(HashMap<WireId, EncodedInput>),
    /// Evaluator asks for the labels of one of its wires.
    OtRequest(WireId),
    /// OT round 1: the group the transfer runs in.
    OtGroup(PrimeGroup),
    /// OT round 2: the sender's commitment `c = g^r`.
    OtCommit(BigUint),
    /// OT round 3: the element the chooser computed in the `h0` slot.
    OtChoice(BigUint),
    /// OT round 4: `c1 = g^k` and both encrypted payloads.
    OtTransfer {
        /// Sender's ephemeral public value.
        c1: BigUint,
        /// Payload for choice bit 0.
        e0: Vec<u8>,
        /// Payload for choice bit 1.
        e1: Vec<u8>,
    },
    /// Both wire encodings in the clear (OT bypass, testing only).
    LabelPair(EncodedInput, EncodedInput),
    /// Phase-5 result map from output wire to cleartext bit.
    Result(BTreeMap<WireId, u8>),
}

impl Message {
    /// Short name used in protocol-violation diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Negotiate { .. } => "negotiate",
            Message::NegotiateReply(_) => "negotiate-reply",
            Message::CircuitPackage { .. } => "circuit-package",
            Message::Ack(_) => "ack",
            Message::GarblerInputs(_) => "garbler-inputs",
            Message::OtRequest(_) => "ot-request",
            Message::OtGroup(_) => "ot-group",
            Message::OtCommit(_) => "ot-commit",
            Message::OtChoice(_) => "ot-choice",
            Message::OtTransfer { .. } => "ot-transfer",
            Message::LabelPair(..) => "label-pair",
            Message::Result(_) => "result",
        }
    }
}

/// Reliable ordered request/reply channel between the two parties.
pub trait Channel {
    /// Transmit one message.
    fn send(&mut self, message: &Message) -> Result<()>;

    /// Block until the next message arrives.
    fn receive(&mut self) -> Result<Message>;

    /// Transmit and block for the reply.
    fn send_wait(&mut self, message: &Message) -> Result<Message> {
        self.send(message)?;
        self.receive()
    }
}

fn encode(message: &Message) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| Error::Transport(format!("cannot encode message: {e}")))
}

fn decode(bytes: &[u8]) -> Result<Message> {
    let (message, consumed): (Message, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| Error::Transport(format!("cannot decode message: {e}")))?;
    if consumed != bytes.len() {
        return Err(Error::Transport("trailing bytes in frame".into()));
    }
    Ok(message)
}

/// TCP transport carrying u32-length-prefixed bincode frames.
#[derive(Debug)]
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Connect to a listening peer, retrying while it comes up.
    pub fn connect<A: ToSocketAddrs + Clone>(addr: A) -> Result<Self> {
        let mut last_error = None;
        for _ in 0..CONNECT_RETRIES {
            match TcpStream::connect(addr.clone()) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(TcpChannel { stream });
                }
                Err(e) => last_error = Some(e),
            }
            std::thread::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS));
        }
        Err(Error::Transport(format!(
            "cannot connect to peer: {}",
            last_error.map_or_else(|| "no address".to_string(), |e| e.to_string())
        )))
    }

    /// Bind `addr` and accept a single peer.
    pub fn listen<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Self::accept(&listener)
    }

    /// Accept a single peer on an already-bound listener.
    pub fn accept(listener: &TcpListener) -> Result<Self> {
        let (stream, peer) = listener.accept()?;
        stream.set_nodelay(true)?;
        trace!("accepted connection from {peer}");
        Ok(TcpChannel { stream })
    }
}

impl Channel for TcpChannel {
    fn send(&mut self, message: &Message) -> Result<()> {
        let payload = encode(message)?;
        trace!("-> {} ({} bytes)", message.kind(), payload.len());
        let length = u32::try_from(payload.len())
            .map_err(|_| Error::Transport("message too large for frame".into()))?;
        self.stream.write_all(&length.to_be_bytes())?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Message> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header)?;
        let length = u32::from_be_bytes(header) as usize;
        if length > MAX_FRAME_BYTES {
            return Err(Error::Transport(format!("frame of {length} bytes too large")));
        }
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload)?;
        let message = decode(&payload)?;
        trace!("<- {} ({} bytes)", message.kind(), length);
        Ok(message)
    }
}

/// In-process channel used by tests; frames go through the same encoding as
/// the TCP transport.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// A connected pair of in-process channels.
pub fn memory_pair() -> (MemoryChannel, MemoryChannel) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    (
        MemoryChannel { tx: tx_a, rx: rx_a },
        MemoryChannel { tx: tx_b, rx: rx_b },
    )
}

impl Channel for MemoryChannel {
    fn send(&mut self, message: &Message) -> Result<()> {
        let payload = encode(message)?;
        self.tx
            .send(payload)
            .map_err(|_| Error::Transport("peer channel closed".into()))
    }

    fn receive(&mut self) -> Result<Message> {
        let payload = self
            .rx
            .recv()
            .map_err(|_| Error::Transport("peer channel closed".into()))?;
        decode(&payload)
    }
}
