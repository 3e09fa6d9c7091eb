//! Coordinated coin mixing with RSA blind signatures.
//!
//! Participants pool their coins into one joint transaction. The coordinator
//! signs each output blindly, outputs are revealed over unlinkable
//! connections, and nobody, the coordinator included, can tell which input
//! paid for which output.

pub mod blame;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod participant;
pub mod server;
pub mod session;
pub mod tier;
pub mod types;
pub mod wallet;

pub use blame::{BanList, BlameReason, BlameRecord, BlameVerdict, Culprit};
pub use client::{CoordinatorTransport, FusionClient, LocalTransport, TransportError};
pub use config::FusionConfig;
pub use coordinator::{Coordinator, CoordinatorEvent, SessionInvite, TierTicket};
pub use crypto::{BlindSigner, CoordinatorPubKey};
pub use error::{FusionError, Result};
pub use participant::{Broadcaster, CoinSource, Participant, Review};
pub use server::{CandidateStatus, CoordinatorHandle, Notice};
pub use session::{Phase, Progress, RequestOutcome, Verdict};
pub use tier::{JoinRequest, TierParams};
pub use types::*;
pub use wallet::MemoryWallet;
