//! Participant side of a round: plans outputs, blinds them, unblinds the
//! coordinator's signatures, and refuses to sign anything it did not agree to.

use alloy::primitives::{Bytes, B256};
use rand::{CryptoRng, RngCore};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::coordinator::SessionInvite;
use crate::crypto::{self, Blinding, CoordinatorPubKey};
use crate::error::{FusionError, Result};
use crate::tier::JoinRequest;
use crate::types::{
    checked_total, BlindedOutputRequest, BlindedSignature, CandidateTransaction, Coin, CoinId,
    CommitmentOpening, InputSignature, OutputSpec, ParticipantHandle, Registration,
    RevealedOutput, SessionId, SignedTransaction,
};

/// The wallet a participant mixes from
pub trait CoinSource: Send + Sync {
    /// Coins eligible for mixing
    fn coins(&self) -> Vec<Coin>;

    /// Schnorr signature over `digest` with the key that owns `coin`
    fn sign_input(&self, coin: &CoinId, digest: &B256) -> Result<Bytes>;

    /// A never-before-used destination script
    fn fresh_destination(&self) -> Bytes;
}

/// Hands a finished transaction to the network
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, tx: &SignedTransaction) -> Result<B256>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Review {
    Approve,
    Reject(String),
}

#[derive(Debug, Clone)]
struct PlannedOutput {
    output: OutputSpec,
    nonce: B256,
    factor: B256,
    message: B256,
    blinding: Blinding,
    signature: Option<Bytes>,
}

#[derive(Debug, Clone)]
struct RoundState {
    session: SessionId,
    handle: ParticipantHandle,
    key: CoordinatorPubKey,
    fee_rate: u64,
    fee: u64,
    outputs: Vec<PlannedOutput>,
    approved: Option<CandidateTransaction>,
}

pub struct Participant {
    wallet: Arc<dyn CoinSource>,
    coins: Vec<Coin>,
    desired_outputs: Vec<u64>,
    round: Option<RoundState>,
}

impl Participant {
    pub fn new(wallet: Arc<dyn CoinSource>, coins: Vec<Coin>, desired_outputs: Vec<u64>) -> Self {
        Self {
            wallet,
            coins,
            desired_outputs,
            round: None,
        }
    }

    /// Mixes every wallet coin into a single output worth the total minus
    /// the fee for `coins + 1` components
    pub fn consolidating(wallet: Arc<dyn CoinSource>, fee_rate: u64) -> Self {
        let coins = wallet.coins();
        let total = coins.iter().map(|c| c.amount).fold(0, u64::saturating_add);
        let fee = fee_rate.saturating_mul(coins.len() as u64 + 1);
        let desired = vec![total.saturating_sub(fee)];
        Self::new(wallet, coins, desired)
    }

    pub fn join_request(&self) -> JoinRequest {
        JoinRequest {
            coins: self.coins.clone(),
            desired_outputs: self.desired_outputs.clone(),
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        self.round.as_ref().map(|r| r.session)
    }

    pub fn handle(&self) -> Option<ParticipantHandle> {
        self.round.as_ref().map(|r| r.handle)
    }

    /// Forgets the current round. The next invite plans fresh outputs.
    pub fn reset(&mut self) {
        self.round = None;
    }

    fn round(&self) -> Result<&RoundState> {
        self.round
            .as_ref()
            .ok_or_else(|| FusionError::Malformed("no round in progress".into()))
    }

    /// Plans this round's outputs under fresh destinations, nonces and
    /// blinding factors, and builds the registration message
    pub fn commit_inputs<R: RngCore + CryptoRng>(
        &mut self,
        invite: &SessionInvite,
        rng: &mut R,
    ) -> Result<Registration> {
        let key = CoordinatorPubKey::from_hex_string(&invite.coordinator_key)?;
        let session = invite.session;

        let overflow = || FusionError::Malformed("amounts overflow".into());
        let inputs = checked_total(self.coins.iter().map(|c| c.amount)).ok_or_else(overflow)?;
        let outputs = checked_total(self.desired_outputs.iter().copied()).ok_or_else(overflow)?;
        let fee = invite
            .fee_rate
            .saturating_mul((self.coins.len() + self.desired_outputs.len()) as u64);
        if outputs.checked_add(fee) != Some(inputs) {
            return Err(FusionError::BalanceMismatch {
                inputs,
                outputs,
                fee,
            });
        }
        if let Some(small) = self.desired_outputs.iter().find(|a| **a < invite.dust_limit) {
            return Err(FusionError::Malformed(format!("output {} below dust", small)));
        }

        let mut planned = Vec::with_capacity(self.desired_outputs.len());
        for amount in &self.desired_outputs {
            let output = OutputSpec::new(self.wallet.fresh_destination(), *amount);
            let nonce = crypto::fresh_secret(rng);
            let factor = crypto::fresh_secret(rng);
            let message = crypto::output_message(&session, &output);
            let blinding = key.blind(&message, &factor)?;
            planned.push(PlannedOutput {
                output,
                nonce,
                factor,
                message,
                blinding,
                signature: None,
            });
        }

        let commitments = planned
            .iter()
            .map(|p| crypto::commit(&session, &p.output, &p.nonce))
            .collect();
        let ownership_proofs = self
            .coins
            .iter()
            .map(|c| {
                self.wallet
                    .sign_input(&c.id, &crypto::ownership_message(&session, &c.id))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(session = %session, outputs = planned.len(), "inputs committed");
        self.round = Some(RoundState {
            session,
            handle: invite.handle,
            key,
            fee_rate: invite.fee_rate,
            fee,
            outputs: planned,
            approved: None,
        });
        Ok(Registration {
            coins: self.coins.clone(),
            commitments,
            ownership_proofs,
        })
    }

    /// One blinded request per planned output, in commitment order
    pub fn request_blind_signatures(&self) -> Result<Vec<BlindedOutputRequest>> {
        Ok(self
            .round()?
            .outputs
            .iter()
            .map(|p| p.blinding.request.clone())
            .collect())
    }

    /// Unblinds and checks every coordinator signature. A missing or bad
    /// signature means the coordinator cheated.
    pub fn unblind(&mut self, signatures: &[BlindedSignature]) -> Result<()> {
        let round = self
            .round
            .as_mut()
            .ok_or_else(|| FusionError::Malformed("no round in progress".into()))?;
        for planned in round.outputs.iter_mut() {
            let id = planned.blinding.request.id();
            let blind_sig = signatures.iter().find(|s| s.id == id).ok_or_else(|| {
                FusionError::Misbehavior("coordinator withheld a blind signature".into())
            })?;
            let signature = round.key.finalize(&planned.blinding, blind_sig, &planned.message)?;
            round
                .key
                .verify(&planned.message, planned.blinding.msg_randomizer, &signature)?;
            planned.signature = Some(signature);
        }
        Ok(())
    }

    /// The unlinkable reveal messages. Carry no seat handle.
    pub fn reveal(&self) -> Result<Vec<RevealedOutput>> {
        self.round()?
            .outputs
            .iter()
            .map(|p| {
                let signature = p.signature.clone().ok_or_else(|| {
                    FusionError::Malformed("output revealed before unblinding".into())
                })?;
                Ok(RevealedOutput {
                    output: p.output.clone(),
                    msg_randomizer: p.blinding.msg_randomizer,
                    signature,
                })
            })
            .collect()
    }

    /// Approves the candidate only if it spends exactly our coins, pays
    /// every output we planned, and balances
    pub fn review_transaction(&mut self, candidate: &CandidateTransaction) -> Review {
        let Some(round) = self.round.as_mut() else {
            return Review::Reject("no round in progress".into());
        };
        let verdict = check_candidate(round, &self.coins, candidate);
        match &verdict {
            Review::Approve => {
                info!(
                    session = %round.session,
                    inputs = candidate.inputs.len(),
                    "candidate approved"
                );
                round.approved = Some(candidate.clone());
            }
            Review::Reject(reason) => {
                warn!(session = %round.session, %reason, "candidate rejected");
                round.approved = None;
            }
        }
        verdict
    }

    /// Signs each own input of the approved candidate
    pub fn sign_inputs(&self) -> Result<Vec<InputSignature>> {
        let round = self.round()?;
        let candidate = round
            .approved
            .as_ref()
            .ok_or_else(|| FusionError::Malformed("no approved candidate to sign".into()))?;
        self.coins
            .iter()
            .map(|coin| {
                let index = candidate
                    .input_index(&coin.id)
                    .ok_or_else(|| FusionError::Misbehavior(format!("{} missing", coin.id)))?;
                let signature = self.wallet.sign_input(&coin.id, &candidate.sighash(index))?;
                Ok(InputSignature {
                    coin: coin.id,
                    signature,
                })
            })
            .collect()
    }

    /// Opens every commitment for the coordinator's blame check
    pub fn blame_openings(&self) -> Result<Vec<CommitmentOpening>> {
        Ok(self
            .round()?
            .outputs
            .iter()
            .map(|p| CommitmentOpening {
                output: p.output.clone(),
                nonce: p.nonce,
                factor: p.factor,
            })
            .collect())
    }
}

fn check_candidate(
    round: &RoundState,
    coins: &[Coin],
    candidate: &CandidateTransaction,
) -> Review {
    if candidate.session != round.session {
        return Review::Reject("candidate belongs to another session".into());
    }
    for coin in coins {
        match candidate.input_index(&coin.id) {
            Some(index) if candidate.inputs[index] == *coin => {}
            Some(_) => return Review::Reject(format!("input {} altered", coin.id)),
            None => return Review::Reject(format!("input {} missing", coin.id)),
        }
    }
    let mut remaining: Vec<&OutputSpec> = candidate.outputs.iter().collect();
    for planned in &round.outputs {
        match remaining.iter().position(|o| **o == planned.output) {
            Some(index) => {
                remaining.swap_remove(index);
            }
            None => return Review::Reject("own output missing or altered".into()),
        }
    }
    if !candidate.is_balanced() {
        return Review::Reject("inputs do not equal outputs plus fee".into());
    }
    let own_in = checked_total(coins.iter().map(|c| c.amount));
    let own_out = checked_total(round.outputs.iter().map(|p| p.output.amount));
    let own_paid = match (own_in, own_out) {
        (Some(own_in), Some(own_out)) => own_in.checked_sub(own_out),
        _ => None,
    };
    if own_paid != Some(round.fee) {
        return Review::Reject("own share does not match the announced rate".into());
    }
    // the whole transaction pays exactly the announced rate
    let components = (candidate.inputs.len() + candidate.outputs.len()) as u64;
    if round.fee_rate.checked_mul(components) != Some(candidate.fee) {
        return Review::Reject("fee does not match the announced rate".into());
    }
    Review::Approve
}
