use rand::RngCore;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use sha3::Shake256;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use std::collections::HashMap;

use crate::circuit::{Circuit, Gate, WireId};
use crate::error::{Error, Result};

/// Wire label: an opaque random byte string standing in for one semantic bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label(Vec<u8>);

impl Label {
    /// Wrap raw bytes as a label.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Label(bytes)
    }

    /// Draw a uniformly random label of `width` bytes.
    pub fn random(rng: &mut ChaCha12Rng, width: usize) -> Self {
        let mut bytes = vec![0u8; width];
        rng.fill_bytes(&mut bytes);
        Label(bytes)
    }

    /// Raw label bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Label width in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the zero-width label (never produced by garbling).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One wire input as held by the evaluator: a label plus its external bit.
///
/// The external bit is the semantic bit XOR the wire's permutation bit and
/// reveals nothing on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedInput {
    /// The chosen wire label.
    pub label: Label,
    /// The observable external bit.
    pub external_bit: u8,
}

impl EncodedInput {
    /// Serialize for use as an OT payload. The encoding round-trips exactly.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| Error::Transport(format!("cannot encode wire input: {e}")))
    }

    /// Inverse of [`EncodedInput::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (decoded, consumed) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| Error::Transport(format!("cannot decode wire input: {e}")))?;
        if consumed != bytes.len() {
            return Err(Error::Transport("trailing bytes after wire input".into()));
        }
        Ok(decoded)
    }
}

/// Encrypted truth table of one gate, indexed by external input bits.
///
/// Rows are ordered `(ea << 1) | eb` for two-input gates and `ea` for NOT, so
/// the evaluator decrypts exactly one row without trial decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarbledTable {
    rows: Vec<Vec<u8>>,
}

impl GarbledTable {
    /// Ciphertext at `index`, if present.
    pub fn row(&self, index: usize) -> Option<&[u8]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Number of rows (2 for NOT, 4 otherwise).
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table carries no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Keystream for one garbled-table row: SHAKE-256 over the input labels and
/// the gate id. Binding the gate id prevents cross-gate key reuse.
pub(crate) fn table_pad(labels: &[&Label], gate_id: WireId, length: usize) -> Vec<u8> {
    let mut hasher = Shake256::default();
    for label in labels {
        hasher.update(label.as_bytes());
    }
    hasher.update(&(gate_id as u64).to_be_bytes());
    let mut pad = vec![0u8; length];
    hasher.finalize_xof().read(&mut pad);
    pad
}

/// XOR two equal-length byte strings.
pub(crate) fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// A fully garbled circuit: label pairs and permutation bits for every wire,
/// and one encrypted truth table per gate.
///
/// Created once by the garbler immediately before transmission and never
/// mutated afterwards.
#[derive(Debug)]
pub struct GarbledCircuit {
    circuit: Circuit,
    labels: HashMap<WireId, [Label; 2]>,
    pbits: HashMap<WireId, u8>,
    tables: HashMap<WireId, GarbledTable>,
}

impl GarbledCircuit {
    /// Garble `circuit` with fresh labels and permutation bits.
    pub fn garble(circuit: Circuit, label_bytes: usize, rng: &mut ChaCha12Rng) -> Result<Self> {
        if label_bytes == 0 {
            return Err(Error::Input("label width must be positive".into()));
        }
        circuit.validate()?;

        let mut labels: HashMap<WireId, [Label; 2]> = HashMap::new();
        let mut pbits: HashMap<WireId, u8> = HashMap::new();
        let wires = circuit
            .alice
            .iter()
            .chain(&circuit.bob)
            .chain(circuit.gates.iter().map(|g| &g.id));
        for &wire in wires {
            labels.insert(
                wire,
                [
                    Label::random(rng, label_bytes),
                    Label::random(rng, label_bytes),
                ],
            );
            pbits.insert(wire, (rng.next_u32() & 1) as u8);
        }

        let mut tables = HashMap::new();
        for gate in &circuit.gates {
            tables.insert(gate.id, garble_gate(gate, &labels, &pbits)?);
        }

        Ok(GarbledCircuit {
            circuit,
            labels,
            pbits,
            tables,
        })
    }

    /// The underlying circuit.
    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    /// Garbled tables keyed by gate id.
    pub fn tables(&self) -> &HashMap<WireId, GarbledTable> {
        &self.tables
    }

    /// Permutation bits restricted to the output wires; the only pbits the
    /// evaluator ever sees.
    pub fn pbits_out(&self) -> HashMap<WireId, u8> {
        self.circuit
            .out
            .iter()
            .filter_map(|wire| self.pbits.get(wire).map(|&pbit| (*wire, pbit)))
            .collect()
    }

    /// The label and external bit encoding semantic `bit` on `wire`.
    pub fn encoded_input(&self, wire: WireId, bit: u8) -> Result<EncodedInput> {
        let pair = self
            .labels
            .get(&wire)
            .ok_or_else(|| Error::Protocol(format!("no labels for wire {wire}")))?;
        let pbit = self.pbit(wire)?;
        let bit = bit & 1;
        Ok(EncodedInput {
            label: pair[bit as usize].clone(),
            external_bit: bit ^ pbit,
        })
    }

    /// Both encodings of `wire`, ordered by semantic bit; the two OT payloads.
    pub fn label_pair(&self, wire: WireId) -> Result<(EncodedInput, EncodedInput)> {
        Ok((self.encoded_input(wire, 0)?, self.encoded_input(wire, 1)?))
    }

    fn pbit(&self, wire: WireId) -> Result<u8> {
        self.pbits
            .get(&wire)
            .copied()
            .ok_or_else(|| Error::Protocol(format!("no permutation bit for wire {wire}")))
    }
}

/// Build the encrypted truth table for one gate.
///
/// For each combination of external input bits the semantic inputs are
/// recovered through the input pbits, the gate function applied, and the
/// output label plus its external bit encrypted under the input labels.
fn garble_gate(
    gate: &Gate,
    labels: &HashMap<WireId, [Label; 2]>,
    pbits: &HashMap<WireId, u8>,
) -> Result<GarbledTable> {
    let out_labels = &labels[&gate.id];
    let out_pbit = pbits[&gate.id];

    let mut rows = Vec::with_capacity(1 << gate.inputs.len());
    match gate.inputs[..] {
        [a] => {
            for ea in 0..2u8 {
                let va = ea ^ pbits[&a];
                let vout = gate.kind.eval(va, 0);
                let key = &labels[&a][va as usize];
                rows.push(encrypt_row(
                    &[key],
                    gate.id,
                    &out_labels[vout as usize],
                    vout ^ out_pbit,
                ));
            }
        }
        [a, b] => {
            for ea in 0..2u8 {
                for eb in 0..2u8 {
                    let va = ea ^ pbits[&a];
                    let vb = eb ^ pbits[&b];
                    let vout = gate.kind.eval(va, vb);
                    let key_a = &labels[&a][va as usize];
                    let key_b = &labels[&b][vb as usize];
                    rows.push(encrypt_row(
                        &[key_a, key_b],
                        gate.id,
                        &out_labels[vout as usize],
                        vout ^ out_pbit,
                    ));
                }
            }
        }
        _ => {
            return Err(Error::Protocol(format!(
                "gate {} has unsupported arity {}",
                gate.id,
                gate.inputs.len()
            )));
        }
    }
    Ok(GarbledTable { rows })
}

fn encrypt_row(keys: &[&Label], gate_id: WireId, out_label: &Label, external_bit: u8) -> Vec<u8> {
    let mut plaintext = out_label.as_bytes().to_vec();
    plaintext.push(external_bit);
    let pad = table_pad(keys, gate_id, plaintext.len());
    xor_bytes(&plaintext, &pad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{GateKind, build_max_circuit};
    use rand::SeedableRng;

    fn test_rng() -> ChaCha12Rng {
        ChaCha12Rng::from_seed([42u8; 32])
    }

    #[test]
    fn test_label_randomness() {
        let mut rng = test_rng();
        let a = Label::random(&mut rng, 16);
        let b = Label::random(&mut rng, 16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_encoded_input_round_trip() {
        let mut rng = test_rng();
        let encoded = EncodedInput {
            label: Label::random(&mut rng, 16),
            external_bit: 1,
        };
        let bytes = encoded.to_bytes().unwrap();
        assert_eq!(EncodedInput::from_bytes(&bytes).unwrap(), encoded);
    }

    #[test]
    fn test_table_pad_separates_gates() {
        let mut rng = test_rng();
        let key = Label::random(&mut rng, 16);
        let pad_a = table_pad(&[&key], 7, 17);
        let pad_b = table_pad(&[&key], 8, 17);
        assert_eq!(pad_a.len(), 17);
        assert_ne!(pad_a, pad_b);
    }

    #[test]
    fn test_garble_assigns_all_wires() {
        let mut rng = test_rng();
        let circuit = build_max_circuit(2, 3);
        let garbled = GarbledCircuit::garble(circuit, 16, &mut rng).unwrap();

        for &wire in garbled
            .circuit()
            .alice
            .iter()
            .chain(&garbled.circuit().bob)
        {
            let (zero, one) = garbled.label_pair(wire).unwrap();
            assert_ne!(zero.label, one.label);
            assert_eq!(zero.external_bit ^ 1, one.external_bit);
        }
        assert_eq!(garbled.tables().len(), garbled.circuit().gates.len());
        assert_eq!(garbled.pbits_out().len(), garbled.circuit().out.len());
    }

    #[test]
    fn test_table_row_counts_match_arity() {
        let mut rng = test_rng();
        let circuit = build_max_circuit(1, 2);
        let garbled = GarbledCircuit::garble(circuit, 16, &mut rng).unwrap();
        for gate in &garbled.circuit().gates {
            let table = &garbled.tables()[&gate.id];
            let expected = match gate.kind {
                GateKind::Not => 2,
                _ => 4,
            };
            assert_eq!(table.len(), expected, "gate {}", gate.id);
        }
    }

    #[test]
    fn test_gate_table_soundness() {
        // Every external-bit combination decrypts to the output encoding whose
        // semantic value matches the gate function.
        let mut rng = test_rng();
        let circuit = build_max_circuit(1, 3);
        let garbled = GarbledCircuit::garble(circuit, 16, &mut rng).unwrap();

        for gate in &garbled.circuit().gates {
            if gate.inputs.len() != 2 {
                continue;
            }
            let (a, b) = (gate.inputs[0], gate.inputs[1]);
            for va in 0..2u8 {
                for vb in 0..2u8 {
                    let in_a = garbled.encoded_input(a, va).unwrap();
                    let in_b = garbled.encoded_input(b, vb).unwrap();
                    let index = ((in_a.external_bit << 1) | in_b.external_bit) as usize;
                    let row = garbled.tables()[&gate.id].row(index).unwrap();
                    let pad = table_pad(&[&in_a.label, &in_b.label], gate.id, row.len());
                    let plain = xor_bytes(row, &pad);

                    let vout = gate.kind.eval(va, vb);
                    let expected = garbled.encoded_input(gate.id, vout).unwrap();
                    assert_eq!(&plain[..16], expected.label.as_bytes());
                    assert_eq!(plain[16], expected.external_bit);
                }
            }
        }
    }

    #[test]
    fn test_garble_rejects_zero_width_labels() {
        let mut rng = test_rng();
        let circuit = build_max_circuit(1, 1);
        assert!(matches!(
            GarbledCircuit::garble(circuit, 0, &mut rng),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn test_independent_runs_disagree() {
        let circuit = build_max_circuit(1, 2);
        let mut rng_a = ChaCha12Rng::from_seed([1u8; 32]);
        let mut rng_b = ChaCha12Rng::from_seed([2u8; 32]);
        let ga = GarbledCircuit::garble(circuit.clone(), 16, &mut rng_a).unwrap();
        let gb = GarbledCircuit::garble(circuit, 16, &mut rng_b).unwrap();
        let wire = ga.circuit().alice[0];
        assert_ne!(
            ga.label_pair(wire).unwrap().0.label,
            gb.label_pair(wire).unwrap().0.label
        );
    }
}
