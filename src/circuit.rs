use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{Error, Result};

/// Wire identifier, unique within a circuit.
pub type WireId = usize;

/// The gate alphabet of the max circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateKind {
    /// One-input inverter.
    Not,
    /// Two-input conjunction.
    And,
    /// Two-input disjunction.
    Or,
    /// Two-input equality (inverted exclusive or).
    Xnor,
}

impl GateKind {
    /// Number of input wires this gate consumes.
    pub fn arity(self) -> usize {
        match self {
            GateKind::Not => 1,
            _ => 2,
        }
    }

    /// Truth function on cleartext bits. `b` is ignored for NOT.
    pub fn eval(self, a: u8, b: u8) -> u8 {
        match self {
            GateKind::Not => a ^ 1,
            GateKind::And => a & b,
            GateKind::Or => a | b,
            GateKind::Xnor => (a ^ b) ^ 1,
        }
    }
}

/// A single gate; `id` is the wire carrying its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    /// Output wire id.
    pub id: WireId,
    /// Gate type.
    #[serde(rename = "type")]
    pub kind: GateKind,
    /// Input wires, length 1 for NOT and 2 otherwise.
    #[serde(rename = "in")]
    pub inputs: Vec<WireId>,
}

/// Boolean circuit with party-input wire sets and designated outputs.
///
/// Gates are stored in topological order: every wire a gate reads is either a
/// party-input wire or the id of an earlier gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Circuit {
    /// Circuit identifier.
    pub id: String,
    /// Garbler input wires, MSB-first per value.
    pub alice: Vec<WireId>,
    /// Evaluator input wires, MSB-first per value.
    pub bob: Vec<WireId>,
    /// Output wires, MSB-first.
    pub out: Vec<WireId>,
    /// Gate list in topological order.
    pub gates: Vec<Gate>,
}

impl Circuit {
    /// Check structural invariants: arities, unique wire ids, and that every
    /// gate only reads wires defined before it.
    pub fn validate(&self) -> Result<()> {
        let mut defined: HashSet<WireId> = HashSet::new();
        for &wire in self.alice.iter().chain(&self.bob) {
            if !defined.insert(wire) {
                return Err(Error::Protocol(format!("duplicate input wire {wire}")));
            }
        }
        for gate in &self.gates {
            if gate.inputs.len() != gate.kind.arity() {
                return Err(Error::Protocol(format!(
                    "gate {} has {} inputs, expected {}",
                    gate.id,
                    gate.inputs.len(),
                    gate.kind.arity()
                )));
            }
            for &wire in &gate.inputs {
                if !defined.contains(&wire) {
                    return Err(Error::Protocol(format!(
                        "gate {} reads undefined wire {wire}",
                        gate.id
                    )));
                }
            }
            if !defined.insert(gate.id) {
                return Err(Error::Protocol(format!("duplicate gate id {}", gate.id)));
            }
        }
        for &wire in &self.out {
            if !defined.contains(&wire) {
                return Err(Error::Protocol(format!("undefined output wire {wire}")));
            }
        }
        Ok(())
    }

    /// Map cleartext input bits onto the party wires, MSB-first.
    pub fn clear_assignment(&self, bits_a: &[u8], bits_b: &[u8]) -> Result<HashMap<WireId, u8>> {
        if bits_a.len() != self.alice.len() || bits_b.len() != self.bob.len() {
            return Err(Error::Protocol(format!(
                "input bit counts {}/{} do not match wire counts {}/{}",
                bits_a.len(),
                bits_b.len(),
                self.alice.len(),
                self.bob.len()
            )));
        }
        let mut assignment = HashMap::new();
        for (&wire, &bit) in self.alice.iter().zip(bits_a) {
            assignment.insert(wire, bit);
        }
        for (&wire, &bit) in self.bob.iter().zip(bits_b) {
            assignment.insert(wire, bit);
        }
        Ok(assignment)
    }

    /// Evaluate the circuit on cleartext bits, returning the output bits in
    /// `out` order. Ground truth for the garbled evaluation.
    pub fn evaluate_plain(&self, assignment: &HashMap<WireId, u8>) -> Result<Vec<u8>> {
        let mut values = assignment.clone();
        for gate in &self.gates {
            let fetch = |wire: &WireId| {
                values
                    .get(wire)
                    .copied()
                    .ok_or_else(|| Error::Protocol(format!("wire {wire} unset")))
            };
            let a = gate
                .inputs
                .first()
                .ok_or_else(|| Error::Protocol(format!("gate {} has no inputs", gate.id)))
                .and_then(fetch)?;
            let b = match gate.inputs.get(1) {
                Some(wire) => fetch(wire)?,
                None => 0,
            };
            values.insert(gate.id, gate.kind.eval(a, b));
        }
        self.out
            .iter()
            .map(|wire| {
                values
                    .get(wire)
                    .copied()
                    .ok_or_else(|| Error::Protocol(format!("output wire {wire} unset")))
            })
            .collect()
    }

    /// Save the circuit as pretty-printed JSON for inspection.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Input(format!("cannot serialize circuit: {e}")))?;
        std::fs::write(path.as_ref(), json)
            .map_err(|e| Error::Input(format!("cannot write circuit dump: {e}")))?;
        Ok(())
    }
}

/// Incremental gate emitter with a rolling next-wire counter.
struct CircuitBuilder {
    gates: Vec<Gate>,
    next_id: WireId,
}

impl CircuitBuilder {
    fn emit(&mut self, kind: GateKind, inputs: Vec<WireId>) -> WireId {
        let id = self.next_id;
        self.next_id += 1;
        self.gates.push(Gate { id, kind, inputs });
        id
    }

    /// Comparator selecting the larger of two k-bit numbers, MSB-first.
    ///
    /// Builds `G = g_{k-1} | (e_{k-1} & g_{k-2}) | ...` with `g_i = a_i & !b_i`
    /// and `e_i = a_i XNOR b_i`, then multiplexes `w_i = (G & a_i) | (!G & b_i)`.
    fn cmp_greater(&mut self, a: &[WireId], b: &[WireId]) -> Vec<WireId> {
        let width = a.len();
        debug_assert_eq!(width, b.len());
        debug_assert!(width >= 1);

        // Most significant position seeds the chain.
        let not_b = self.emit(GateKind::Not, vec![b[0]]);
        let first_greater = self.emit(GateKind::And, vec![a[0], not_b]);

        let select = if width == 1 {
            first_greater
        } else {
            let mut partial = first_greater;
            let mut carry = self.emit(GateKind::Xnor, vec![a[0], b[0]]);
            for i in 1..width {
                let not_b = self.emit(GateKind::Not, vec![b[i]]);
                let greater = self.emit(GateKind::And, vec![a[i], not_b]);
                // The least significant position no longer extends the
                // equality carry.
                let equal = (i < width - 1).then(|| self.emit(GateKind::Xnor, vec![a[i], b[i]]));
                let masked = self.emit(GateKind::And, vec![greater, carry]);
                partial = self.emit(GateKind::Or, vec![masked, partial]);
                if let Some(equal) = equal {
                    carry = self.emit(GateKind::And, vec![equal, carry]);
                }
            }
            partial
        };

        // k-bit multiplexer keyed on the comparison outcome.
        let picked_a: Vec<WireId> = a
            .iter()
            .map(|&wire| self.emit(GateKind::And, vec![select, wire]))
            .collect();
        let not_select = self.emit(GateKind::Not, vec![select]);
        let picked_b: Vec<WireId> = b
            .iter()
            .map(|&wire| self.emit(GateKind::And, vec![not_select, wire]))
            .collect();
        picked_a
            .into_iter()
            .zip(picked_b)
            .map(|(pa, pb)| self.emit(GateKind::Or, vec![pa, pb]))
            .collect()
    }
}

/// Synthesize the circuit computing the maximum of `2n` k-bit integers.
///
/// Garbler inputs occupy wires `1..=n*k`, evaluator inputs `n*k+1..=2*n*k`;
/// internal wires follow. The reduction is a left fold of the pairwise
/// comparator over the garbler's values, then the evaluator's.
pub fn build_max_circuit(input_length: usize, bit_length: usize) -> Circuit {
    let n = input_length;
    let k = bit_length;
    debug_assert!(n >= 1 && k >= 1);

    let alice: Vec<WireId> = (1..=n * k).collect();
    let bob: Vec<WireId> = (n * k + 1..=2 * n * k).collect();

    let mut builder = CircuitBuilder {
        gates: Vec::new(),
        next_id: 2 * n * k + 1,
    };

    let mut values = alice.chunks(k).chain(bob.chunks(k));
    let mut acc: Vec<WireId> = values.next().map(<[WireId]>::to_vec).unwrap_or_default();
    for value in values {
        acc = builder.cmp_greater(&acc, value);
    }

    Circuit {
        id: "max_value".to_string(),
        alice,
        bob,
        out: acc,
        gates: builder.gates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{bits, value_from_bits};

    fn run_max(circuit: &Circuit, a_values: &[u64], b_values: &[u64], k: usize) -> u64 {
        let bits_a: Vec<u8> = a_values.iter().flat_map(|&v| bits(v, k)).collect();
        let bits_b: Vec<u8> = b_values.iter().flat_map(|&v| bits(v, k)).collect();
        let assignment = circuit.clear_assignment(&bits_a, &bits_b).unwrap();
        value_from_bits(&circuit.evaluate_plain(&assignment).unwrap())
    }

    #[test]
    fn test_gate_kind_truth_tables() {
        assert_eq!(GateKind::Not.eval(0, 0), 1);
        assert_eq!(GateKind::Not.eval(1, 0), 0);
        assert_eq!(GateKind::And.eval(1, 1), 1);
        assert_eq!(GateKind::And.eval(1, 0), 0);
        assert_eq!(GateKind::Or.eval(0, 0), 0);
        assert_eq!(GateKind::Or.eval(0, 1), 1);
        assert_eq!(GateKind::Xnor.eval(0, 0), 1);
        assert_eq!(GateKind::Xnor.eval(1, 0), 0);
        assert_eq!(GateKind::Xnor.eval(1, 1), 1);
    }

    #[test]
    fn test_comparator_is_max_exhaustive() {
        // Pairwise comparator equals max(A, B) for every width up to 6.
        for k in 1..=6 {
            let circuit = build_max_circuit(1, k);
            for a in 0..(1u64 << k) {
                for b in 0..(1u64 << k) {
                    let got = run_max(&circuit, &[a], &[b], k);
                    assert_eq!(got, a.max(b), "k={k} a={a} b={b}");
                }
            }
        }
    }

    #[test]
    fn test_max_over_multiple_values() {
        let circuit = build_max_circuit(3, 3);
        assert_eq!(run_max(&circuit, &[1, 2, 3], &[4, 5, 6], 3), 6);
        assert_eq!(run_max(&circuit, &[7, 0, 0], &[1, 4, 2], 3), 7);
        assert_eq!(run_max(&circuit, &[0, 0, 0], &[0, 0, 0], 3), 0);
    }

    #[test]
    fn test_wire_layout() {
        let n = 2;
        let k = 3;
        let circuit = build_max_circuit(n, k);
        assert_eq!(circuit.alice, (1..=n * k).collect::<Vec<_>>());
        assert_eq!(circuit.bob, (n * k + 1..=2 * n * k).collect::<Vec<_>>());
        assert_eq!(circuit.out.len(), k);
        assert!(circuit.gates.first().unwrap().id == 2 * n * k + 1);
    }

    #[test]
    fn test_synthesized_circuits_are_topologically_valid() {
        for (n, k) in [(1, 1), (1, 4), (2, 3), (3, 5)] {
            let circuit = build_max_circuit(n, k);
            circuit.validate().unwrap();
            // Gate ids increase monotonically as they are appended.
            for pair in circuit.gates.windows(2) {
                assert!(pair[0].id < pair[1].id);
            }
        }
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let circuit = Circuit {
            id: "bad".to_string(),
            alice: vec![1],
            bob: vec![2],
            out: vec![3],
            gates: vec![
                Gate {
                    id: 3,
                    kind: GateKind::And,
                    inputs: vec![1, 4],
                },
                Gate {
                    id: 4,
                    kind: GateKind::Not,
                    inputs: vec![2],
                },
            ],
        };
        assert!(matches!(circuit.validate(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_validate_rejects_bad_arity() {
        let circuit = Circuit {
            id: "bad".to_string(),
            alice: vec![1],
            bob: vec![2],
            out: vec![3],
            gates: vec![Gate {
                id: 3,
                kind: GateKind::Not,
                inputs: vec![1, 2],
            }],
        };
        assert!(matches!(circuit.validate(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_json_dump_field_names() {
        let circuit = build_max_circuit(1, 1);
        let json = serde_json::to_string(&circuit).unwrap();
        assert!(json.contains("\"type\":\"NOT\""));
        assert!(json.contains("\"in\":"));
    }
}
