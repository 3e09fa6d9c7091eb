use alloy::primitives::{Bytes, FixedBytes, B256};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::tagged_hash;

/// Single-use identifier minted for every round attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub B256);

impl SessionId {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut raw = [0u8; 32];
        rng.fill_bytes(&mut raw);
        Self(B256::from(raw))
    }
}

// Ids are truncated in logs and errors so full values never land in log files.
impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", short_hex(self.0.as_slice()))
    }
}

/// Network identity of a connected player, assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player-{}", self.0)
    }
}

/// Stable per-session seat of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantHandle(pub u32);

impl fmt::Display for ParticipantHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TierId(pub u32);

/// Reference to a spendable transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoinId {
    pub txid: B256,
    pub vout: u32,
}

impl CoinId {
    pub fn new(txid: B256, vout: u32) -> Self {
        Self { txid, vout }
    }

    pub fn encode(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(self.txid.as_slice());
        out[32..].copy_from_slice(&self.vout.to_le_bytes());
        out
    }
}

impl fmt::Display for CoinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", short_hex(self.txid.as_slice()), self.vout)
    }
}

/// Public description of a coin offered for fusion. The key that can spend
/// it stays with the wallet; only the x-only public key travels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub id: CoinId,
    pub amount: u64,
    pub owner: FixedBytes<32>,
}

/// Plaintext output: where the funds go and how much
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputSpec {
    pub destination: Bytes,
    pub amount: u64,
}

impl OutputSpec {
    pub fn new(destination: impl Into<Bytes>, amount: u64) -> Self {
        Self {
            destination: destination.into(),
            amount,
        }
    }

    /// Canonical byte encoding used in commitments, blind messages and digests
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.destination.len());
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.extend_from_slice(&(self.destination.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.destination);
        out
    }
}

/// Hiding and binding digest over an output and a random nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment(pub B256);

/// What a participant discloses about one output when the round goes to blame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentOpening {
    pub output: OutputSpec,
    pub nonce: B256,
    pub factor: B256,
}

/// An output blinded under the coordinator key. Holds no plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlindedOutputRequest {
    pub blind_msg: Bytes,
    pub factor_tag: B256,
}

impl BlindedOutputRequest {
    /// Identifier a blind signature is returned under
    pub fn id(&self) -> B256 {
        tagged_hash(b"blind-fusion/request-id", &[&self.blind_msg[..]])
    }
}

/// A blind signature returned from the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedSignature {
    pub blind_sig: Bytes,
    pub id: B256,
}

/// An unblinded output presented anonymously to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedOutput {
    pub output: OutputSpec,
    pub msg_randomizer: Option<B256>,
    pub signature: Bytes,
}

/// A participant's pledge: coins, one commitment per intended output, and a
/// proof of ownership for every coin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub coins: Vec<Coin>,
    pub commitments: Vec<Commitment>,
    pub ownership_proofs: Vec<Bytes>,
}

impl Registration {
    /// `None` when the stated amounts overflow
    pub fn input_total(&self) -> Option<u64> {
        checked_total(self.coins.iter().map(|c| c.amount))
    }
}

/// Sum of amounts, `None` on overflow
pub fn checked_total(amounts: impl IntoIterator<Item = u64>) -> Option<u64> {
    amounts
        .into_iter()
        .try_fold(0u64, |total, amount| total.checked_add(amount))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSignature {
    pub coin: CoinId,
    pub signature: Bytes,
}

/// The joint transaction proposed for review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTransaction {
    pub session: SessionId,
    pub inputs: Vec<Coin>,
    pub outputs: Vec<OutputSpec>,
    pub fee: u64,
}

impl CandidateTransaction {
    /// Builds the candidate in canonical order so that position leaks nothing
    /// about who contributed what.
    pub fn canonical(
        session: SessionId,
        mut inputs: Vec<Coin>,
        mut outputs: Vec<OutputSpec>,
        fee: u64,
    ) -> Self {
        inputs.sort_by(|a, b| a.id.cmp(&b.id));
        outputs.sort_by(|a, b| {
            (a.amount, &a.destination[..]).cmp(&(b.amount, &b.destination[..]))
        });
        Self {
            session,
            inputs,
            outputs,
            fee,
        }
    }

    pub fn input_total(&self) -> Option<u64> {
        checked_total(self.inputs.iter().map(|c| c.amount))
    }

    pub fn output_total(&self) -> Option<u64> {
        checked_total(self.outputs.iter().map(|o| o.amount))
    }

    /// Inputs equal outputs plus fee, with no total overflowing
    pub fn is_balanced(&self) -> bool {
        match (self.input_total(), self.output_total()) {
            (Some(inputs), Some(outputs)) => outputs.checked_add(self.fee) == Some(inputs),
            _ => false,
        }
    }

    pub fn input_index(&self, coin: &CoinId) -> Option<usize> {
        self.inputs.iter().position(|c| &c.id == coin)
    }

    pub fn digest(&self) -> B256 {
        let capacity = self.inputs.len() + self.outputs.len() + 4;
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(capacity);
        parts.push(self.session.0.to_vec());
        parts.push((self.inputs.len() as u32).to_le_bytes().to_vec());
        for coin in &self.inputs {
            let mut part = coin.id.encode().to_vec();
            part.extend_from_slice(&coin.amount.to_le_bytes());
            part.extend_from_slice(coin.owner.as_slice());
            parts.push(part);
        }
        parts.push((self.outputs.len() as u32).to_le_bytes().to_vec());
        for output in &self.outputs {
            parts.push(output.encode());
        }
        parts.push(self.fee.to_le_bytes().to_vec());
        let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        tagged_hash(b"blind-fusion/tx", &refs)
    }

    /// Message signed by the owner of input `index`
    pub fn sighash(&self, index: usize) -> B256 {
        let digest = self.digest();
        tagged_hash(
            b"blind-fusion/sighash",
            &[digest.as_slice(), &(index as u32).to_le_bytes()],
        )
    }
}

/// Fully signed transaction handed to the broadcast collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: CandidateTransaction,
    /// One signature per input, in input order
    pub witnesses: Vec<Bytes>,
}

impl SignedTransaction {
    pub fn txid(&self) -> B256 {
        self.tx.digest()
    }
}

pub(crate) fn short_hex(bytes: &[u8]) -> String {
    let take = bytes.len().min(4);
    format!("0x{}..", hex::encode(&bytes[..take]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(byte: u8, vout: u32, amount: u64) -> Coin {
        Coin {
            id: CoinId::new(B256::repeat_byte(byte), vout),
            amount,
            owner: FixedBytes::repeat_byte(byte),
        }
    }

    #[test]
    fn test_candidate_is_canonical() {
        let session = SessionId(B256::repeat_byte(7));
        let a = CandidateTransaction::canonical(
            session,
            vec![coin(2, 0, 50), coin(1, 1, 60)],
            vec![OutputSpec::new(vec![9u8], 40), OutputSpec::new(vec![8u8], 30)],
            40,
        );
        let b = CandidateTransaction::canonical(
            session,
            vec![coin(1, 1, 60), coin(2, 0, 50)],
            vec![OutputSpec::new(vec![8u8], 30), OutputSpec::new(vec![9u8], 40)],
            40,
        );
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.inputs[0].id.txid, B256::repeat_byte(1));
        assert_eq!(a.outputs[0].amount, 30);
        assert!(a.is_balanced());
    }

    #[test]
    fn test_sighash_differs_per_input() {
        let tx = CandidateTransaction::canonical(
            SessionId(B256::ZERO),
            vec![coin(1, 0, 10), coin(2, 0, 10)],
            vec![OutputSpec::new(vec![1u8], 18)],
            2,
        );
        assert_ne!(tx.sighash(0), tx.sighash(1));
        assert_eq!(tx.input_index(&tx.inputs[1].id), Some(1));
    }

    #[test]
    fn test_unbalanced_candidate() {
        let tx = CandidateTransaction::canonical(
            SessionId(B256::ZERO),
            vec![coin(1, 0, 10)],
            vec![OutputSpec::new(vec![1u8], 10)],
            1,
        );
        assert!(!tx.is_balanced());
    }

    #[test]
    fn test_overflowing_outputs_never_balance() {
        // the outputs wrap around to exactly the input amount
        let tx = CandidateTransaction::canonical(
            SessionId(B256::ZERO),
            vec![coin(1, 0, 10)],
            vec![
                OutputSpec::new(vec![1u8], u64::MAX),
                OutputSpec::new(vec![2u8], 11),
            ],
            0,
        );
        assert_eq!(tx.output_total(), None);
        assert!(!tx.is_balanced());
        assert_eq!(checked_total([u64::MAX / 2 + 1, u64::MAX / 2 + 1]), None);
        assert_eq!(checked_total([3, 4]), Some(7));
    }

    #[test]
    fn test_session_id_display_is_truncated() {
        let id = SessionId(B256::repeat_byte(0xab));
        assert_eq!(id.to_string(), "0xabababab..");
    }
}
