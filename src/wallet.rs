//! In-memory coin source holding one Schnorr key per coin.

use alloy::primitives::{Bytes, B256};
use rand::{CryptoRng, Rng, RngCore};
use secp256k1::Keypair;
use std::collections::HashMap;

use crate::crypto::{self, fresh_secret};
use crate::error::{FusionError, Result};
use crate::participant::CoinSource;
use crate::types::{Coin, CoinId};

/// Script prefix of a version-0, 20-byte witness program
const P2WPKH_PREFIX: [u8; 2] = [0x00, 0x14];

#[derive(Default)]
pub struct MemoryWallet {
    coins: Vec<Coin>,
    keys: HashMap<CoinId, Keypair>,
}

impl MemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A wallet with one freshly keyed coin per amount
    pub fn with_coins<R: RngCore + CryptoRng>(rng: &mut R, amounts: &[u64]) -> Self {
        let mut wallet = Self::new();
        for amount in amounts {
            wallet.receive(rng, *amount);
        }
        wallet
    }

    /// Adds a coin under a new key and returns it
    pub fn receive<R: RngCore + CryptoRng>(&mut self, rng: &mut R, amount: u64) -> Coin {
        let keypair = Keypair::new(crypto::secp(), rng);
        let coin = Coin {
            id: CoinId::new(fresh_secret(rng), rng.gen_range(0..4)),
            amount,
            owner: crypto::owner_key(&keypair),
        };
        self.keys.insert(coin.id, keypair);
        self.coins.push(coin.clone());
        coin
    }

    pub fn balance(&self) -> u64 {
        self.coins.iter().map(|c| c.amount).fold(0, u64::saturating_add)
    }
}

impl CoinSource for MemoryWallet {
    fn coins(&self) -> Vec<Coin> {
        self.coins.clone()
    }

    fn sign_input(&self, coin: &CoinId, digest: &B256) -> Result<Bytes> {
        let keypair = self
            .keys
            .get(coin)
            .ok_or_else(|| FusionError::Malformed(format!("wallet does not own {}", coin)))?;
        Ok(crypto::sign_digest(keypair, digest))
    }

    fn fresh_destination(&self) -> Bytes {
        let mut script = P2WPKH_PREFIX.to_vec();
        script.extend_from_slice(&rand::thread_rng().gen::<[u8; 20]>());
        Bytes::from(script)
    }
}
