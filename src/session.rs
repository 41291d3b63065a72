use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::channel::{Channel, Lengths, Message};
use crate::circuit::{Circuit, WireId, build_max_circuit};
use crate::constants::{DEFAULT_LABEL_BYTES, DEFAULT_PRIME_BITS};
use crate::error::{Error, Result};
use crate::evaluator;
use crate::garbler::{EncodedInput, GarbledCircuit, GarbledTable};
use crate::group::PrimeGroup;
use crate::input;
use crate::ot;

/// Tunable protocol knobs shared by both parties.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolOptions {
    /// Run the OT subprotocol; disabling it sends both labels in the clear
    /// and exists only for protocol validation.
    pub oblivious_transfer: bool,
    /// Bit width of the OT group modulus.
    pub prime_bits: u64,
    /// Wire-label width in bytes.
    pub label_bytes: usize,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        ProtocolOptions {
            oblivious_transfer: true,
            prime_bits: DEFAULT_PRIME_BITS,
            label_bytes: DEFAULT_LABEL_BYTES,
        }
    }
}

/// Garbler-side session states; transitions are driven by the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarblerState {
    /// Session created, nothing sent yet.
    Init,
    /// Lengths agreed.
    Negotiated,
    /// Circuit and tables transmitted.
    SentCircuit,
    /// Own input encodings transmitted.
    SentInputs,
    /// Serving per-wire transfers.
    OtLoop,
    /// Waiting for the evaluator's result map.
    AwaitResult,
    /// Result received; session over.
    Done,
}

impl fmt::Display for GarblerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GarblerState::Init => "initialization",
            GarblerState::Negotiated => "length negotiation",
            GarblerState::SentCircuit => "circuit transmission",
            GarblerState::SentInputs => "input exchange",
            GarblerState::OtLoop => "oblivious transfer loop",
            GarblerState::AwaitResult => "result collection",
            GarblerState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Evaluator-side session states, symmetric to the garbler's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorState {
    /// Waiting for the garbler's first message.
    Listening,
    /// Lengths agreed.
    Negotiated,
    /// Circuit and tables received and validated.
    ReceivedCircuit,
    /// Garbler input encodings received.
    ReceivedInputs,
    /// Fetching own labels wire by wire.
    OtLoop,
    /// Result map transmitted.
    SentResult,
    /// Session over.
    Done,
}

impl fmt::Display for EvaluatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvaluatorState::Listening => "listening",
            EvaluatorState::Negotiated => "length negotiation",
            EvaluatorState::ReceivedCircuit => "circuit reception",
            EvaluatorState::ReceivedInputs => "input exchange",
            EvaluatorState::OtLoop => "oblivious transfer loop",
            EvaluatorState::SentResult => "result return",
            EvaluatorState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Largest bit width among a party's inputs.
fn local_bit_length(inputs: &[u64]) -> usize {
    inputs
        .iter()
        .copied()
        .map(input::bit_length)
        .max()
        .unwrap_or(1)
}

/// The garbler drives the session: it negotiates sizes, synthesizes and
/// garbles the max circuit, transfers labels and collects the result.
pub struct GarblerSession<C: Channel> {
    channel: C,
    inputs: Vec<u64>,
    options: ProtocolOptions,
    rng: ChaCha12Rng,
    state: GarblerState,
    lengths: Lengths,
    circuits: Vec<GarbledCircuit>,
}

impl<C: Channel> fmt::Debug for GarblerSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarblerSession")
            .field("state", &self.state)
            .field("lengths", &self.lengths)
            .finish_non_exhaustive()
    }
}

impl<C: Channel> GarblerSession<C> {
    /// Create a session over `channel` for a non-empty input list.
    pub fn new(channel: C, inputs: Vec<u64>, options: ProtocolOptions) -> Result<Self> {
        if inputs.is_empty() {
            return Err(Error::Input("garbler input list is empty".into()));
        }
        Ok(GarblerSession {
            channel,
            inputs,
            options,
            rng: ChaCha12Rng::from_os_rng(),
            state: GarblerState::Init,
            lengths: Lengths {
                input_length: 0,
                bit_length: 0,
            },
            circuits: Vec::new(),
        })
    }

    /// Current state, for diagnostics after a failed run.
    pub fn state(&self) -> GarblerState {
        self.state
    }

    /// Garbled circuit records owned by this session.
    pub fn circuits(&self) -> &[GarbledCircuit] {
        &self.circuits
    }

    /// Append a garbled circuit record. The protocol transmits the first one.
    pub fn add_circuit(&mut self, garbled: GarbledCircuit) {
        self.circuits.push(garbled);
    }

    /// Run the whole session and return the computed maximum.
    pub fn run(&mut self) -> Result<u64> {
        self.negotiate()?;
        self.prepare_circuit()?;
        self.send_circuit()?;
        self.send_own_inputs()?;
        self.serve_transfers()?;
        let result = self.await_result()?;
        let value = self.reconstruct(&result)?;
        self.state = GarblerState::Done;
        info!("secure maximum is {value}");
        Ok(value)
    }

    /// Phase 1: offer scaled sizes, adopt the evaluator's maxima.
    fn negotiate(&mut self) -> Result<()> {
        let offer = Lengths {
            input_length: input::scaled_length(self.inputs.len(), &mut self.rng),
            bit_length: local_bit_length(&self.inputs),
        };
        debug!(
            "garbler offers input_length={} bit_length={}",
            offer.input_length, offer.bit_length
        );
        let reply = self
            .channel
            .send_wait(&Message::Negotiate {
                preliminary_data: offer,
            })?;
        let lengths = match reply {
            Message::NegotiateReply(lengths) => lengths,
            other => {
                return Err(Error::Protocol(format!(
                    "expected negotiate-reply, received {}",
                    other.kind()
                )));
            }
        };
        if lengths.input_length < offer.input_length || lengths.bit_length < offer.bit_length {
            return Err(Error::Protocol(
                "negotiated lengths fall below our offer".into(),
            ));
        }
        info!(
            "agreed on input_length={} bit_length={}",
            lengths.input_length, lengths.bit_length
        );
        self.lengths = lengths;
        self.state = GarblerState::Negotiated;
        Ok(())
    }

    /// Phase 3 preparation: synthesize and garble the max circuit.
    fn prepare_circuit(&mut self) -> Result<()> {
        let circuit = build_max_circuit(self.lengths.input_length, self.lengths.bit_length);
        debug!(
            "synthesized circuit '{}' with {} gates",
            circuit.id,
            circuit.gates.len()
        );
        let garbled = GarbledCircuit::garble(circuit, self.options.label_bytes, &mut self.rng)?;
        self.add_circuit(garbled);
        Ok(())
    }

    /// Phase 3: transmit the first circuit record and wait for the ack.
    fn send_circuit(&mut self) -> Result<()> {
        let entry = self
            .circuits
            .first()
            .ok_or_else(|| Error::Protocol("no garbled circuit prepared".into()))?;
        let package = Message::CircuitPackage {
            circuit: entry.circuit().clone(),
            garbled_tables: entry.tables().clone(),
            pbits_out: entry.pbits_out(),
        };
        debug!("sending circuit {}", entry.circuit().id);
        let reply = self.channel.send_wait(&package)?;
        match reply {
            Message::Ack(true) => {}
            Message::Ack(false) => {
                return Err(Error::Protocol("evaluator rejected the circuit".into()));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected ack, received {}",
                    other.kind()
                )));
            }
        }
        self.state = GarblerState::SentCircuit;
        Ok(())
    }

    /// Phase 4: pad own inputs and send the wire encodings in the clear; the
    /// garbler knows its own bits, so no transfer is needed here.
    fn send_own_inputs(&mut self) -> Result<()> {
        let padded =
            input::expand_and_shuffle(&self.inputs, self.lengths.input_length, &mut self.rng);
        let bits = input::encode_values(&padded, self.lengths.bit_length);

        let entry = self
            .circuits
            .first()
            .ok_or_else(|| Error::Protocol("no garbled circuit prepared".into()))?;
        if bits.len() != entry.circuit().alice.len() {
            return Err(Error::Protocol(format!(
                "{} input bits for {} garbler wires",
                bits.len(),
                entry.circuit().alice.len()
            )));
        }
        let mut encodings = HashMap::new();
        for (&wire, &bit) in entry.circuit().alice.iter().zip(&bits) {
            encodings.insert(wire, entry.encoded_input(wire, bit)?);
        }
        debug!("sending {} garbler input encodings", encodings.len());
        self.channel.send(&Message::GarblerInputs(encodings))?;
        self.state = GarblerState::SentInputs;
        Ok(())
    }

    /// Phase 4, evaluator half: answer one transfer request per evaluator
    /// wire, through OT or in the clear when bypassed.
    fn serve_transfers(&mut self) -> Result<()> {
        let group = if self.options.oblivious_transfer {
            Some(PrimeGroup::generate(self.options.prime_bits, &mut self.rng)?)
        } else {
            None
        };
        let bob_wires: Vec<WireId> = self
            .circuits
            .first()
            .ok_or_else(|| Error::Protocol("no garbled circuit prepared".into()))?
            .circuit()
            .bob
            .clone();
        self.state = GarblerState::OtLoop;

        let progress = ProgressBar::new(bob_wires.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
                .unwrap()
                .progress_chars("##-"),
        );
        progress.set_message("Transferring evaluator labels...");

        for _ in 0..bob_wires.len() {
            let request = self.channel.receive()?;
            let wire = match request {
                Message::OtRequest(wire) => wire,
                other => {
                    return Err(Error::Protocol(format!(
                        "expected ot-request, received {}",
                        other.kind()
                    )));
                }
            };
            if !bob_wires.contains(&wire) {
                return Err(Error::Protocol(format!(
                    "wire {wire} is not an evaluator input"
                )));
            }
            debug!("transfer requested for wire {wire}");
            let pair = self.circuits[0].label_pair(wire)?;
            match &group {
                Some(group) => {
                    let m0 = pair.0.to_bytes()?;
                    let m1 = pair.1.to_bytes()?;
                    ot::sender_transfer(&mut self.channel, group, &mut self.rng, &m0, &m1)?;
                }
                None => ot::sender_transfer_clear(&mut self.channel, pair)?,
            }
            progress.inc(1);
        }
        progress.finish_with_message(format!("✓ Transferred {} labels", bob_wires.len()));
        Ok(())
    }

    /// Phase 5: collect the evaluator's result map.
    fn await_result(&mut self) -> Result<BTreeMap<WireId, u8>> {
        self.state = GarblerState::AwaitResult;
        match self.channel.receive()? {
            Message::Result(result) => Ok(result),
            other => Err(Error::Protocol(format!(
                "expected result, received {}",
                other.kind()
            ))),
        }
    }

    /// Reassemble the output integer from the MSB-first output wires.
    fn reconstruct(&self, result: &BTreeMap<WireId, u8>) -> Result<u64> {
        let entry = self
            .circuits
            .first()
            .ok_or_else(|| Error::Protocol("no garbled circuit prepared".into()))?;
        let bits = entry
            .circuit()
            .out
            .iter()
            .map(|wire| {
                let bit = result
                    .get(wire)
                    .copied()
                    .ok_or_else(|| Error::Protocol(format!("result misses output wire {wire}")))?;
                if bit > 1 {
                    return Err(Error::Protocol(format!(
                        "result bit {bit} for wire {wire} out of range"
                    )));
                }
                Ok(bit)
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(input::value_from_bits(&bits))
    }
}

/// The evaluator is passive: it answers negotiation, receives the circuit,
/// fetches its labels through OT, evaluates and returns the result.
pub struct EvaluatorSession<C: Channel> {
    channel: C,
    inputs: Vec<u64>,
    options: ProtocolOptions,
    rng: ChaCha12Rng,
    state: EvaluatorState,
    lengths: Lengths,
}

impl<C: Channel> fmt::Debug for EvaluatorSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorSession")
            .field("state", &self.state)
            .field("lengths", &self.lengths)
            .finish_non_exhaustive()
    }
}

impl<C: Channel> EvaluatorSession<C> {
    /// Create a session over `channel` for a non-empty input list.
    pub fn new(channel: C, inputs: Vec<u64>, options: ProtocolOptions) -> Result<Self> {
        if inputs.is_empty() {
            return Err(Error::Input("evaluator input list is empty".into()));
        }
        Ok(EvaluatorSession {
            channel,
            inputs,
            options,
            rng: ChaCha12Rng::from_os_rng(),
            state: EvaluatorState::Listening,
            lengths: Lengths {
                input_length: 0,
                bit_length: 0,
            },
        })
    }

    /// Current state, for diagnostics after a failed run.
    pub fn state(&self) -> EvaluatorState {
        self.state
    }

    /// Run the whole session and return the computed maximum.
    pub fn run(&mut self) -> Result<u64> {
        self.negotiate()?;
        let (circuit, tables, pbits_out) = self.receive_circuit()?;
        let garbler_inputs = self.receive_garbler_inputs(&circuit)?;
        let own_inputs = self.fetch_own_inputs(&circuit)?;

        let mut inputs = garbler_inputs;
        inputs.extend(own_inputs);
        let result = evaluator::evaluate(&circuit, &tables, &pbits_out, &inputs)?;

        debug!("sending circuit evaluation");
        self.channel.send(&Message::Result(result.clone()))?;
        self.state = EvaluatorState::SentResult;

        let bits = circuit
            .out
            .iter()
            .map(|wire| result.get(wire).copied().unwrap_or(0))
            .collect::<Vec<u8>>();
        let value = input::value_from_bits(&bits);
        self.state = EvaluatorState::Done;
        info!("secure maximum is {value}");
        Ok(value)
    }

    /// Phase 1, passive half: wait for the garbler's offer, answer with the
    /// element-wise maximum of both parties' sizes.
    fn negotiate(&mut self) -> Result<()> {
        let offer = match self.channel.receive()? {
            Message::Negotiate { preliminary_data } => preliminary_data,
            other => {
                return Err(Error::Protocol(format!(
                    "expected negotiate, received {}",
                    other.kind()
                )));
            }
        };
        let own = Lengths {
            input_length: input::scaled_length(self.inputs.len(), &mut self.rng),
            bit_length: local_bit_length(&self.inputs),
        };
        debug!(
            "evaluator holds input_length={} bit_length={}",
            own.input_length, own.bit_length
        );
        let agreed = Lengths {
            input_length: offer.input_length.max(own.input_length),
            bit_length: offer.bit_length.max(own.bit_length),
        };
        self.channel.send(&Message::NegotiateReply(agreed))?;
        info!(
            "agreed on input_length={} bit_length={}",
            agreed.input_length, agreed.bit_length
        );
        self.lengths = agreed;
        self.state = EvaluatorState::Negotiated;
        Ok(())
    }

    /// Phase 3, passive half: receive and validate the garbled circuit.
    #[allow(clippy::type_complexity)]
    fn receive_circuit(
        &mut self,
    ) -> Result<(
        Circuit,
        HashMap<WireId, GarbledTable>,
        HashMap<WireId, u8>,
    )> {
        let (circuit, tables, pbits_out) = match self.channel.receive()? {
            Message::CircuitPackage {
                circuit,
                garbled_tables,
                pbits_out,
            } => (circuit, garbled_tables, pbits_out),
            other => {
                return Err(Error::Protocol(format!(
                    "expected circuit-package, received {}",
                    other.kind()
                )));
            }
        };

        circuit.validate()?;
        let expected = self.lengths.input_length * self.lengths.bit_length;
        if circuit.alice.len() != expected || circuit.bob.len() != expected {
            return Err(Error::Protocol(format!(
                "circuit carries {}/{} input wires, negotiated sizes require {expected}",
                circuit.alice.len(),
                circuit.bob.len()
            )));
        }
        for wire in &circuit.out {
            match pbits_out.get(wire) {
                Some(0 | 1) => {}
                Some(_) => {
                    return Err(Error::Protocol(format!(
                        "output pbit for wire {wire} out of range"
                    )));
                }
                None => {
                    return Err(Error::Protocol(format!(
                        "missing output pbit for wire {wire}"
                    )));
                }
            }
        }

        debug!("received circuit {} with {} gates", circuit.id, circuit.gates.len());
        self.channel.send(&Message::Ack(true))?;
        self.state = EvaluatorState::ReceivedCircuit;
        Ok((circuit, tables, pbits_out))
    }

    /// Phase 4: receive the garbler's own wire encodings.
    fn receive_garbler_inputs(
        &mut self,
        circuit: &Circuit,
    ) -> Result<HashMap<WireId, EncodedInput>> {
        let encodings = match self.channel.receive()? {
            Message::GarblerInputs(encodings) => encodings,
            other => {
                return Err(Error::Protocol(format!(
                    "expected garbler-inputs, received {}",
                    other.kind()
                )));
            }
        };
        for wire in &circuit.alice {
            if !encodings.contains_key(wire) {
                return Err(Error::Protocol(format!(
                    "garbler inputs miss wire {wire}"
                )));
            }
        }
        debug!("received {} garbler input encodings", encodings.len());
        self.state = EvaluatorState::ReceivedInputs;
        Ok(encodings)
    }

    /// Phase 4, own half: request each of our wires and run the chooser side
    /// of the transfer, keeping the input bits hidden.
    fn fetch_own_inputs(&mut self, circuit: &Circuit) -> Result<HashMap<WireId, EncodedInput>> {
        let padded =
            input::expand_and_shuffle(&self.inputs, self.lengths.input_length, &mut self.rng);
        let bits = input::encode_values(&padded, self.lengths.bit_length);
        if bits.len() != circuit.bob.len() {
            return Err(Error::Protocol(format!(
                "{} input bits for {} evaluator wires",
                bits.len(),
                circuit.bob.len()
            )));
        }

        self.state = EvaluatorState::OtLoop;
        let mut encodings = HashMap::new();
        for (&wire, &bit) in circuit.bob.iter().zip(&bits) {
            debug!("requesting labels for wire {wire}");
            self.channel.send(&Message::OtRequest(wire))?;
            let encoding = if self.options.oblivious_transfer {
                let payload = ot::chooser_receive(&mut self.channel, &mut self.rng, bit)?;
                EncodedInput::from_bytes(&payload)?
            } else {
                ot::chooser_receive_clear(&mut self.channel, bit)?
            };
            encodings.insert(wire, encoding);
        }
        Ok(encodings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory_pair;

    fn run_session(
        garbler_inputs: Vec<u64>,
        evaluator_inputs: Vec<u64>,
        options: ProtocolOptions,
    ) -> (u64, u64) {
        let (garbler_chan, evaluator_chan) = memory_pair();

        let evaluator = std::thread::spawn(move || {
            let mut session =
                EvaluatorSession::new(evaluator_chan, evaluator_inputs, options).unwrap();
            session.run().unwrap()
        });

        let mut session = GarblerSession::new(garbler_chan, garbler_inputs, options).unwrap();
        let garbler_value = session.run().unwrap();
        assert_eq!(session.state(), GarblerState::Done);
        let evaluator_value = evaluator.join().unwrap();
        (garbler_value, evaluator_value)
    }

    #[test]
    fn test_session_computes_max_with_ot_bypassed() {
        let options = ProtocolOptions {
            oblivious_transfer: false,
            ..ProtocolOptions::default()
        };
        let (garbler_value, evaluator_value) = run_session(vec![3, 14], vec![9, 2], options);
        assert_eq!(garbler_value, 14);
        assert_eq!(evaluator_value, 14);
    }

    #[test]
    fn test_session_rejects_empty_inputs() {
        let (garbler_chan, evaluator_chan) = memory_pair();
        assert!(matches!(
            GarblerSession::new(garbler_chan, vec![], ProtocolOptions::default()),
            Err(Error::Input(_))
        ));
        assert!(matches!(
            EvaluatorSession::new(evaluator_chan, vec![], ProtocolOptions::default()),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn test_garbler_aborts_on_unexpected_message() {
        let (garbler_chan, mut evaluator_chan) = memory_pair();
        let rogue = std::thread::spawn(move || {
            // Answer the negotiation with a result message.
            let _ = evaluator_chan.receive().unwrap();
            evaluator_chan
                .send(&Message::Result(BTreeMap::new()))
                .unwrap();
        });

        let mut session =
            GarblerSession::new(garbler_chan, vec![5], ProtocolOptions::default()).unwrap();
        let outcome = session.run();
        rogue.join().unwrap();
        assert!(matches!(outcome, Err(Error::Protocol(_))));
        assert_eq!(session.state(), GarblerState::Init);
    }

    #[test]
    fn test_garbler_aborts_on_closed_channel() {
        let (garbler_chan, evaluator_chan) = memory_pair();
        drop(evaluator_chan);
        let mut session =
            GarblerSession::new(garbler_chan, vec![5], ProtocolOptions::default()).unwrap();
        assert!(matches!(session.run(), Err(Error::Transport(_))));
    }
}
