use log::{debug, trace};
use num_bigint::BigUint;
use rand_chacha::ChaCha12Rng;
use sha3::Shake256;
use sha3::digest::{ExtendableOutput, Update, XofReader};

use crate::channel::{Channel, Message};
use crate::error::{Error, Result};
use crate::garbler::{EncodedInput, xor_bytes};
use crate::group::PrimeGroup;

/// Derive `length` key bytes from a group element.
///
/// The element is serialized big-endian and fed through SHAKE-256 so the pad
/// matches the payload exactly.
pub fn kdf(element: &BigUint, length: usize) -> Vec<u8> {
    let mut hasher = Shake256::default();
    hasher.update(&element.to_bytes_be());
    let mut key = vec![0u8; length];
    hasher.finalize_xof().read(&mut key);
    key
}

/// Sender side of one 1-out-of-2 transfer.
///
/// Protocol following Smart's "Cryptography Made Simple": the sender commits
/// to `c = g^r`, receives the chooser's `h0`, derives `h1 = c * h0^-1` and
/// encrypts each payload under the corresponding Diffie-Hellman key. The
/// chooser can only form one of the two keys, and the sender never learns
/// which.
pub fn sender_transfer<C: Channel>(
    channel: &mut C,
    group: &PrimeGroup,
    rng: &mut ChaCha12Rng,
    m0: &[u8],
    m1: &[u8],
) -> Result<()> {
    debug!("OT sender round started");
    let reply = channel.send_wait(&Message::OtGroup(group.clone()))?;
    expect_ack(reply)?;

    let r = group.rand_int(rng);
    let c = group.gen_pow(&r);
    let reply = channel.send_wait(&Message::OtCommit(c.clone()))?;
    let h0 = match reply {
        Message::OtChoice(h) => h,
        other => {
            return Err(Error::Protocol(format!(
                "expected ot-choice, received {}",
                other.kind()
            )));
        }
    };
    let h1 = group.mul(&c, &group.inv(&h0));

    let k = group.rand_int(rng);
    let c1 = group.gen_pow(&k);
    let e0 = xor_bytes(m0, &kdf(&group.pow(&h0, &k), m0.len()));
    let e1 = xor_bytes(m1, &kdf(&group.pow(&h1, &k), m1.len()));

    trace!(target: "ot", "sender offers c1={c1}, e0={e0:02x?}, e1={e1:02x?}");
    channel.send(&Message::OtTransfer { c1, e0, e1 })?;
    debug!("OT sender round ended");
    Ok(())
}

/// Chooser side of one 1-out-of-2 transfer; recovers the payload for `bit`.
///
/// The chooser computes `h = g^x` and places it in the slot matching its bit:
/// the element transmitted is always the one the sender will treat as `h0`,
/// so for `bit = 1` the chooser sends `c * (g^x)^-1` instead. Only `g^x`'s
/// slot yields a key the chooser can rebuild as `c1^x`.
pub fn chooser_receive<C: Channel>(channel: &mut C, rng: &mut ChaCha12Rng, bit: u8) -> Result<Vec<u8>> {
    debug!("OT chooser round started");
    let group = match channel.receive()? {
        Message::OtGroup(group) => group,
        other => {
            return Err(Error::Protocol(format!(
                "expected ot-group, received {}",
                other.kind()
            )));
        }
    };
    group.validate(rng)?;
    channel.send(&Message::Ack(true))?;

    let c = match channel.receive()? {
        Message::OtCommit(c) => c,
        other => {
            return Err(Error::Protocol(format!(
                "expected ot-commit, received {}",
                other.kind()
            )));
        }
    };

    let x = group.rand_int(rng);
    let x_pow = group.gen_pow(&x);
    let masked = group.mul(&c, &group.inv(&x_pow));
    let h0 = if bit & 1 == 0 { x_pow } else { masked };

    let reply = channel.send_wait(&Message::OtChoice(h0))?;
    let (c1, e0, e1) = match reply {
        Message::OtTransfer { c1, e0, e1 } => (c1, e0, e1),
        other => {
            return Err(Error::Protocol(format!(
                "expected ot-transfer, received {}",
                other.kind()
            )));
        }
    };

    let chosen = if bit & 1 == 0 { e0 } else { e1 };
    let payload = xor_bytes(&chosen, &kdf(&group.pow(&c1, &x), chosen.len()));
    trace!(target: "ot", "chooser used bit {bit} and recovered {payload:02x?}");
    debug!("OT chooser round ended");
    Ok(payload)
}

/// Sender side with OT disabled: both encodings go out in the clear.
/// Insecure; exists only for protocol validation.
pub fn sender_transfer_clear<C: Channel>(
    channel: &mut C,
    pair: (EncodedInput, EncodedInput),
) -> Result<()> {
    channel.send(&Message::LabelPair(pair.0, pair.1))
}

/// Chooser side with OT disabled: picks one of the cleartext encodings.
pub fn chooser_receive_clear<C: Channel>(channel: &mut C, bit: u8) -> Result<EncodedInput> {
    match channel.receive()? {
        Message::LabelPair(zero, one) => Ok(if bit & 1 == 0 { zero } else { one }),
        other => Err(Error::Protocol(format!(
            "expected label-pair, received {}",
            other.kind()
        ))),
    }
}

fn expect_ack(message: Message) -> Result<()> {
    match message {
        Message::Ack(true) => Ok(()),
        Message::Ack(false) => Err(Error::Protocol("peer rejected OT group".into())),
        other => Err(Error::Protocol(format!(
            "expected ack, received {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory_pair;
    use rand::SeedableRng;

    fn transfer(m0: &[u8], m1: &[u8], bit: u8) -> Vec<u8> {
        let (mut sender_chan, mut chooser_chan) = memory_pair();
        let m0 = m0.to_vec();
        let m1 = m1.to_vec();

        let sender = std::thread::spawn(move || {
            let mut rng = ChaCha12Rng::from_seed([11u8; 32]);
            let group = PrimeGroup::generate(32, &mut rng).unwrap();
            sender_transfer(&mut sender_chan, &group, &mut rng, &m0, &m1).unwrap();
        });

        let mut rng = ChaCha12Rng::from_seed([12u8; 32]);
        let payload = chooser_receive(&mut chooser_chan, &mut rng, bit).unwrap();
        sender.join().unwrap();
        payload
    }

    #[test]
    fn test_chooser_recovers_selected_message() {
        assert_eq!(transfer(b"left", b"right", 0), b"left");
        assert_eq!(transfer(b"left", b"right", 1), b"right");
    }

    #[test]
    fn test_messages_of_different_lengths() {
        assert_eq!(transfer(b"a", b"considerably longer", 1), b"considerably longer");
    }

    #[test]
    fn test_kdf_is_length_exact_and_keyed() {
        let a = kdf(&BigUint::from(12345u32), 16);
        let b = kdf(&BigUint::from(12346u32), 16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        // Prefix property of the XOF: same element, longer output.
        let long = kdf(&BigUint::from(12345u32), 32);
        assert_eq!(&long[..16], &a[..]);
    }

    #[test]
    fn test_clear_bypass_picks_by_bit() {
        use crate::garbler::Label;

        let zero = EncodedInput {
            label: Label::from_bytes(vec![0u8; 16]),
            external_bit: 0,
        };
        let one = EncodedInput {
            label: Label::from_bytes(vec![1u8; 16]),
            external_bit: 1,
        };

        let (mut sender_chan, mut chooser_chan) = memory_pair();
        sender_transfer_clear(&mut sender_chan, (zero.clone(), one.clone())).unwrap();
        assert_eq!(chooser_receive_clear(&mut chooser_chan, 1).unwrap(), one);

        sender_transfer_clear(&mut sender_chan, (zero.clone(), one)).unwrap();
        assert_eq!(chooser_receive_clear(&mut chooser_chan, 0).unwrap(), zero);
    }
}
