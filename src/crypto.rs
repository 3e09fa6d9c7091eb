use alloy::primitives::{Bytes, FixedBytes, B256};
use blind_rsa_signatures::reexports::rsa::BigUint;
use blind_rsa_signatures::reexports::rsa::PublicKeyParts;
use blind_rsa_signatures::reexports::rsa::RsaPublicKey as BlindRsaPublicKey;
use blind_rsa_signatures::{
    BlindSignature, KeyPair, MessageRandomizer, Options, PublicKey, Secret, Signature,
};
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use secp256k1::{schnorr, All, Keypair, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::error::{FusionError, Result};
use crate::types::{
    BlindedOutputRequest, BlindedSignature, CoinId, Commitment, OutputSpec, SessionId,
};

/// SHA-256 over a domain tag and length-prefixed parts
pub fn tagged_hash(tag: &[u8], parts: &[&[u8]]) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update((tag.len() as u32).to_le_bytes());
    hasher.update(tag);
    for part in parts {
        hasher.update((part.len() as u32).to_le_bytes());
        hasher.update(part);
    }
    let out: [u8; 32] = hasher.finalize().into();
    B256::from(out)
}

/// 32 bytes from a cryptographically secure generator, used for commitment
/// nonces and blinding factors alike
pub fn fresh_secret<R: RngCore + CryptoRng>(rng: &mut R) -> B256 {
    let mut raw = [0u8; 32];
    rng.fill_bytes(&mut raw);
    B256::from(raw)
}

pub fn commit(session: &SessionId, output: &OutputSpec, nonce: &B256) -> Commitment {
    Commitment(tagged_hash(
        b"blind-fusion/commit",
        &[session.0.as_slice(), &output.encode(), nonce.as_slice()],
    ))
}

pub fn open(
    commitment: &Commitment,
    session: &SessionId,
    output: &OutputSpec,
    nonce: &B256,
) -> bool {
    commit(session, output, nonce) == *commitment
}

/// One-way fingerprint of a blinding factor. Lets the coordinator spot a
/// reused factor without learning it.
pub fn factor_tag(factor: &B256) -> B256 {
    tagged_hash(b"blind-fusion/factor-tag", &[factor.as_slice()])
}

/// The message the coordinator blind-signs for an output. Bound to the
/// session so a signature cannot be replayed in another round.
pub fn output_message(session: &SessionId, output: &OutputSpec) -> B256 {
    tagged_hash(
        b"blind-fusion/output",
        &[session.0.as_slice(), &output.encode()],
    )
}

/// Message a coin owner signs to prove control at registration time
pub fn ownership_message(session: &SessionId, coin: &CoinId) -> B256 {
    tagged_hash(
        b"blind-fusion/ownership",
        &[session.0.as_slice(), &coin.encode()],
    )
}

/// Participant-side result of blinding one output message
#[derive(Debug, Clone)]
pub struct Blinding {
    pub request: BlindedOutputRequest,
    pub secret: Bytes,
    pub msg_randomizer: Option<B256>,
}

/// The coordinator's public key for blind signature operations
#[derive(Debug, Clone)]
pub struct CoordinatorPubKey {
    pub_key: PublicKey,
}

impl CoordinatorPubKey {
    /// Create a new CoordinatorPubKey from a raw `PublicKey`
    pub fn new(pub_key: PublicKey) -> Self {
        Self { pub_key }
    }

    /// Parse the `0x{exponent}00{modulus}` hex form
    pub fn from_hex_string(hex_key: &str) -> Result<Self> {
        let hex = hex_key.trim_start_matches("0x");
        if hex.len() <= 8 {
            return Err(FusionError::Malformed("coordinator key too short".into()));
        }

        // e is 0x010001 in practice
        let exponent_hex = &hex[0..6];
        let modulus_hex = &hex[8..];

        let exponent_bytes =
            hex::decode(exponent_hex).map_err(|e| FusionError::Malformed(e.to_string()))?;
        let modulus_bytes =
            hex::decode(modulus_hex).map_err(|e| FusionError::Malformed(e.to_string()))?;

        let exponent = BigUint::from_bytes_be(&exponent_bytes);
        let modulus = BigUint::from_bytes_be(&modulus_bytes);

        let blind_key = BlindRsaPublicKey::new(modulus, exponent)
            .map_err(|e| FusionError::Malformed(format!("coordinator key: {}", e)))?;

        Ok(Self {
            pub_key: PublicKey(blind_key),
        })
    }

    pub fn to_hex_string(&self) -> String {
        let modulus = self.pub_key.n().to_bytes_be();
        let exponent = self.pub_key.e().to_bytes_be();

        format!("0x{}00{}", hex::encode(exponent), hex::encode(modulus))
    }

    /// Blind `msg` with randomness drawn only from `factor`. The same inputs
    /// always give the same blinded message, which is what lets a disputed
    /// request be re-derived during blame.
    pub fn blind(&self, msg: &B256, factor: &B256) -> Result<Blinding> {
        let options = Options::default();
        let mut rng = ChaCha20Rng::from_seed(factor.0);

        let blinding_result = self
            .pub_key
            .blind(&mut rng, msg.as_slice(), true, &options)
            .map_err(|e| FusionError::Crypto(format!("blinding failed: {:?}", e)))?;

        let msg_randomizer = blinding_result
            .msg_randomizer
            .map(|r| B256::from(r.0));

        Ok(Blinding {
            request: BlindedOutputRequest {
                blind_msg: Bytes::from(blinding_result.blind_msg.0),
                factor_tag: factor_tag(factor),
            },
            secret: Bytes::from(blinding_result.secret.0),
            msg_randomizer,
        })
    }

    /// Unblind a coordinator signature and check it before returning it
    pub fn finalize(
        &self,
        blinding: &Blinding,
        blind_sig: &BlindedSignature,
        msg: &B256,
    ) -> Result<Bytes> {
        if blinding.request.id() != blind_sig.id {
            return Err(FusionError::Misbehavior(
                "blind signature returned under the wrong request id".into(),
            ));
        }

        let options = Options::default();
        let sig = BlindSignature(blind_sig.blind_sig.to_vec());
        let secret = Secret(blinding.secret.to_vec());
        let msg_randomizer = blinding.msg_randomizer.map(|r| MessageRandomizer(r.0));

        let finalized_sig = self
            .pub_key
            .finalize(&sig, &secret, msg_randomizer, msg.as_slice(), &options)
            .map_err(|e| {
                FusionError::Misbehavior(format!("signature does not finalize: {:?}", e))
            })?;

        Ok(Bytes::from(finalized_sig.0))
    }

    pub fn verify(&self, msg: &B256, msg_randomizer: Option<B256>, signature: &[u8]) -> Result<()> {
        let options = Options::default();
        let sig = Signature(signature.to_vec());
        let msg_randomizer = msg_randomizer.map(|r| MessageRandomizer(r.0));

        self.pub_key
            .verify(&sig, msg_randomizer, msg.as_slice(), &options)
            .map_err(|_| FusionError::Misbehavior("invalid output signature".into()))
    }
}

/// The coordinator's signing authority. It only ever sees
/// [`BlindedOutputRequest`]s, so plaintext outputs cannot reach it.
pub struct BlindSigner {
    key_pair: KeyPair,
    public: CoordinatorPubKey,
}

impl BlindSigner {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, modulus_bits: usize) -> Result<Self> {
        let key_pair = KeyPair::generate(rng, modulus_bits)
            .map_err(|e| FusionError::Crypto(format!("key generation failed: {:?}", e)))?;
        Ok(Self::from_key_pair(key_pair))
    }

    pub fn from_key_pair(key_pair: KeyPair) -> Self {
        let public = CoordinatorPubKey::new(key_pair.pk.clone());
        Self { key_pair, public }
    }

    pub fn public_key(&self) -> &CoordinatorPubKey {
        &self.public
    }

    pub fn sign<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        request: &BlindedOutputRequest,
    ) -> Result<BlindedSignature> {
        let blind_sig = self
            .key_pair
            .sk
            .blind_sign(rng, &request.blind_msg[..], &Options::default())
            .map_err(|e| FusionError::Malformed(format!("cannot sign blinded request: {:?}", e)))?;

        Ok(BlindedSignature {
            blind_sig: Bytes::from(blind_sig.0),
            id: request.id(),
        })
    }
}

pub(crate) fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

/// x-only public key that identifies a coin owner on the wire
pub fn owner_key(keypair: &Keypair) -> FixedBytes<32> {
    let (xonly, _parity) = keypair.x_only_public_key();
    FixedBytes::from(xonly.serialize())
}

/// BIP-340 Schnorr signature over a 32-byte digest
pub fn sign_digest(keypair: &Keypair, digest: &B256) -> Bytes {
    let msg = Message::from_digest(digest.0);
    let sig = secp().sign_schnorr(&msg, keypair);
    Bytes::from(sig.serialize().to_vec())
}

pub fn verify_digest(owner: &FixedBytes<32>, digest: &B256, signature: &[u8]) -> bool {
    let Ok(xonly) = XOnlyPublicKey::from_slice(owner.as_slice()) else {
        return false;
    };
    let Ok(sig) = schnorr::Signature::from_slice(signature) else {
        return false;
    };
    let msg = Message::from_digest(digest.0);
    secp().verify_schnorr(&sig, &msg, &xonly).is_ok()
}

/// One RSA key shared by every unit test; generation is slow
#[cfg(test)]
pub(crate) fn shared_test_signer() -> &'static std::sync::Arc<BlindSigner> {
    static SIGNER: OnceLock<std::sync::Arc<BlindSigner>> = OnceLock::new();
    SIGNER.get_or_init(|| {
        let signer =
            BlindSigner::generate(&mut rand::thread_rng(), 2048).expect("test key generation");
        std::sync::Arc::new(signer)
    })
}

#[cfg(test)]
pub(crate) fn test_signer() -> &'static BlindSigner {
    shared_test_signer()
}
