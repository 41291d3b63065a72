use std::collections::{BTreeMap, HashMap};

use crate::circuit::{Circuit, WireId};
use crate::error::{Error, Result};
use crate::garbler::{EncodedInput, GarbledTable, Label, table_pad, xor_bytes};

/// Evaluate a garbled circuit.
///
/// `inputs` must hold exactly one `(label, external_bit)` pair per party-input
/// wire. Gates are processed in topological order; each observed external-bit
/// combination selects a single table row, decrypted under the input labels
/// with no trial decryption. Output bits are recovered through `pbits_out`.
pub fn evaluate(
    circuit: &Circuit,
    tables: &HashMap<WireId, GarbledTable>,
    pbits_out: &HashMap<WireId, u8>,
    inputs: &HashMap<WireId, EncodedInput>,
) -> Result<BTreeMap<WireId, u8>> {
    let mut active: HashMap<WireId, EncodedInput> = inputs.clone();

    for gate in &circuit.gates {
        let table = tables
            .get(&gate.id)
            .ok_or_else(|| Error::Protocol(format!("no garbled table for gate {}", gate.id)))?;

        let mut keys: Vec<&Label> = Vec::with_capacity(gate.inputs.len());
        let mut index = 0usize;
        for wire in &gate.inputs {
            let input = active
                .get(wire)
                .ok_or_else(|| Error::Protocol(format!("wire {wire} unset at gate {}", gate.id)))?;
            keys.push(&input.label);
            index = (index << 1) | (input.external_bit as usize & 1);
        }

        let output = decrypt_row(table, index, &keys, gate.id)?;
        active.insert(gate.id, output);
    }

    let mut result = BTreeMap::new();
    for &wire in &circuit.out {
        let output = active
            .get(&wire)
            .ok_or_else(|| Error::Protocol(format!("output wire {wire} never computed")))?;
        let pbit = pbits_out
            .get(&wire)
            .ok_or_else(|| Error::Protocol(format!("no output pbit for wire {wire}")))?;
        result.insert(wire, output.external_bit ^ (pbit & 1));
    }
    Ok(result)
}

/// Decrypt one table row and parse the `(label, external_bit)` plaintext.
///
/// Any shape mismatch means the table cannot have been produced by an honest
/// garbling of this circuit.
fn decrypt_row(
    table: &GarbledTable,
    index: usize,
    keys: &[&Label],
    gate_id: WireId,
) -> Result<EncodedInput> {
    let row = table
        .row(index)
        .ok_or(Error::GarbledTableCorrupt(gate_id))?;
    let expected_len = keys
        .first()
        .map(|label| label.len() + 1)
        .unwrap_or_default();
    if row.len() != expected_len || expected_len < 2 {
        return Err(Error::GarbledTableCorrupt(gate_id));
    }

    let pad = table_pad(keys, gate_id, row.len());
    let mut plaintext = xor_bytes(row, &pad);
    let external_bit = plaintext.pop().unwrap_or(2);
    if external_bit > 1 {
        return Err(Error::GarbledTableCorrupt(gate_id));
    }
    Ok(EncodedInput {
        label: Label::from_bytes(plaintext),
        external_bit,
    })
}
