//! Payload kinds carried by the replicated stores.
//!
//! Both families are closed enums. Behaviour that differs per kind (time to
//! live, response priority, one-shot semantics, capability gating, date
//! sorting) is exposed as metadata on the enum instead of being re-derived
//! at each call site.

use crate::crypto::{hash, hash_of, PubKeyBytes};
use crate::mailbox::message::PrefixedSealedAndSignedMessage;
use crate::network::capabilities::{Capabilities, Capability};
use crate::network::node_address::NodeAddress;
use crate::storage::byte_array::StorageByteArray;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub type ExtraData = BTreeMap<String, String>;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub const MAILBOX_TTL_MAX: Duration = Duration::from_secs(15 * 24 * 60 * 60);
pub const MAILBOX_TTL_MIN: Duration = Duration::from_secs(60 * 60);
pub const OFFER_TTL: Duration = Duration::from_secs(9 * 60);

/// Persistable payload hashes must have exactly this size.
pub const PAYLOAD_HASH_SIZE: usize = 32;

pub const TRADE_STATISTICS_MAX_ITEMS: usize = 3_000;
const DATE_TOLERANCE: Duration = DAY;

/// Where an entry sits in a bulk response when the response must be cut.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GetDataResponsePriority {
    Low,
    Mid,
    High,
}

/// Which key authorizes an add operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipMode {
    /// The entry's owner key must equal the payload owner key.
    OwnerKey,
    /// The entry is signed by the sender embedded in the payload; the
    /// payload owner is the receiver.
    SenderKey,
}

/// Date and cap for payloads that may be trimmed oldest-first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateSortable {
    pub date: i64,
    pub max_items: usize,
}

// ---------------------------------------------------------------------------
// Protected (owner signed) payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub message: String,
    pub version: String,
    pub is_update_info: bool,
    pub owner_pub_key: PubKeyBytes,
    pub extra_data: Option<ExtraData>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub banned_node_addresses: Vec<String>,
    pub banned_offer_ids: Vec<String>,
    pub banned_signer_pub_keys: Vec<String>,
    pub creation_date: i64,
    pub owner_pub_key: PubKeyBytes,
    pub extra_data: Option<ExtraData>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisputeAgentRole {
    Arbitrator,
    Mediator,
    RefundAgent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeAgent {
    pub role: DisputeAgentRole,
    pub node_address: NodeAddress,
    pub language_codes: Vec<String>,
    pub registration_date: i64,
    pub owner_pub_key: PubKeyBytes,
    pub extra_data: Option<ExtraData>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferDirection {
    Buy,
    Sell,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub id: String,
    pub owner_node_address: NodeAddress,
    pub direction: OfferDirection,
    pub currency_code: String,
    pub price: i64,
    pub amount: i64,
    pub min_amount: i64,
    pub date: i64,
    pub owner_pub_key: PubKeyBytes,
    pub extra_data: Option<ExtraData>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateNotificationPayload {
    pub message: String,
    pub owner_pub_key: PubKeyBytes,
    pub extra_data: Option<ExtraData>,
}

/// A sealed message parked in the network for an offline receiver.
///
/// `owner_pub_key` is the receiver's storage key; the sender proves the add
/// with `sender_pub_key_for_add_operation`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStoragePayload {
    pub prefixed_sealed_and_signed_message: PrefixedSealedAndSignedMessage,
    pub sender_pub_key_for_add_operation: PubKeyBytes,
    pub owner_pub_key: PubKeyBytes,
    pub ttl_ms: i64,
    pub extra_data: Option<ExtraData>,
}

impl MailboxStoragePayload {
    pub fn new(
        prefixed_sealed_and_signed_message: PrefixedSealedAndSignedMessage,
        sender_pub_key_for_add_operation: PubKeyBytes,
        owner_pub_key: PubKeyBytes,
        ttl: Duration,
    ) -> Self {
        Self {
            prefixed_sealed_and_signed_message,
            sender_pub_key_for_add_operation,
            owner_pub_key,
            ttl_ms: ttl.as_millis() as i64,
            extra_data: None,
        }
    }

    pub fn ttl(&self) -> Duration {
        let ttl = Duration::from_millis(self.ttl_ms.max(0) as u64);
        ttl.clamp(MAILBOX_TTL_MIN, MAILBOX_TTL_MAX)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectedStoragePayload {
    Alert(Alert),
    Filter(Filter),
    DisputeAgent(DisputeAgent),
    Offer(OfferPayload),
    PrivateNotification(PrivateNotificationPayload),
    Mailbox(MailboxStoragePayload),
}

impl ProtectedStoragePayload {
    pub fn owner_pub_key(&self) -> &PubKeyBytes {
        match self {
            Self::Alert(p) => &p.owner_pub_key,
            Self::Filter(p) => &p.owner_pub_key,
            Self::DisputeAgent(p) => &p.owner_pub_key,
            Self::Offer(p) => &p.owner_pub_key,
            Self::PrivateNotification(p) => &p.owner_pub_key,
            Self::Mailbox(p) => &p.owner_pub_key,
        }
    }

    pub fn extra_data(&self) -> Option<&ExtraData> {
        match self {
            Self::Alert(p) => p.extra_data.as_ref(),
            Self::Filter(p) => p.extra_data.as_ref(),
            Self::DisputeAgent(p) => p.extra_data.as_ref(),
            Self::Offer(p) => p.extra_data.as_ref(),
            Self::PrivateNotification(p) => p.extra_data.as_ref(),
            Self::Mailbox(p) => p.extra_data.as_ref(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Alert(_) => "Alert",
            Self::Filter(_) => "Filter",
            Self::DisputeAgent(p) => match p.role {
                DisputeAgentRole::Arbitrator => "Arbitrator",
                DisputeAgentRole::Mediator => "Mediator",
                DisputeAgentRole::RefundAgent => "RefundAgent",
            },
            Self::Offer(_) => "OfferPayload",
            Self::PrivateNotification(_) => "PrivateNotificationPayload",
            Self::Mailbox(_) => "MailboxStoragePayload",
        }
    }

    /// Time to live; `None` for payloads that never expire.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::Alert(_) => Some(DAY * 90),
            Self::Filter(_) => Some(DAY * 180),
            Self::DisputeAgent(_) => Some(DAY * 10),
            Self::Offer(_) => Some(OFFER_TTL),
            Self::PrivateNotification(_) => Some(DAY * 10),
            Self::Mailbox(p) => Some(p.ttl()),
        }
    }

    pub fn priority(&self) -> GetDataResponsePriority {
        match self {
            Self::Alert(_) | Self::Filter(_) | Self::DisputeAgent(_) => GetDataResponsePriority::High,
            Self::Offer(_) | Self::Mailbox(_) => GetDataResponsePriority::Mid,
            Self::PrivateNotification(_) => GetDataResponsePriority::Low,
        }
    }

    /// Once removed, an add-once payload can never be added again.
    pub fn is_add_once(&self) -> bool {
        matches!(self, Self::Mailbox(_))
    }

    pub fn ownership_mode(&self) -> OwnershipMode {
        match self {
            Self::Mailbox(_) => OwnershipMode::SenderKey,
            _ => OwnershipMode::OwnerKey,
        }
    }

    pub fn required_capabilities(&self) -> Option<Capabilities> {
        match self {
            Self::DisputeAgent(p) => match p.role {
                DisputeAgentRole::Mediator => Some(Capabilities::single(Capability::Mediation)),
                DisputeAgentRole::RefundAgent => Some(Capabilities::single(Capability::RefundAgent)),
                DisputeAgentRole::Arbitrator => None,
            },
            _ => None,
        }
    }

    /// Payloads whose presence depends on the owner being reachable.
    pub fn owner_node_address(&self) -> Option<&NodeAddress> {
        match self {
            Self::Offer(p) => Some(&p.owner_node_address),
            _ => None,
        }
    }

    /// Written to the local protected data store in addition to the live map.
    pub fn is_persistable(&self) -> bool {
        matches!(self, Self::Filter(_) | Self::DisputeAgent(_))
    }

    /// Only keys on the privileged allow-list may publish these.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Alert(_) | Self::Filter(_) | Self::DisputeAgent(_))
    }

    pub fn hash(&self) -> StorageByteArray {
        StorageByteArray::from(hash_of(self))
    }
}

// ---------------------------------------------------------------------------
// Append-only payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub currency: String,
    pub price: i64,
    pub amount: i64,
    pub payment_method: String,
    pub date: i64,
    pub extra_data: Option<ExtraData>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAgeWitness {
    pub hash: Vec<u8>,
    pub date: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationMethod {
    Arbitrator,
    Trade,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedWitness {
    pub verification_method: VerificationMethod,
    pub account_age_witness_hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub signer_pub_key: PubKeyBytes,
    pub witness_owner_pub_key: PubKeyBytes,
    pub date: i64,
    pub trade_amount: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PersistableKind {
    TradeStatistics,
    AccountAgeWitness,
    SignedWitness,
}

impl PersistableKind {
    pub const ALL: [PersistableKind; 3] = [
        PersistableKind::TradeStatistics,
        PersistableKind::AccountAgeWitness,
        PersistableKind::SignedWitness,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::TradeStatistics => "TradeStatistics",
            Self::AccountAgeWitness => "AccountAgeWitness",
            Self::SignedWitness => "SignedWitness",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistableNetworkPayload {
    TradeStatistics(TradeStatistics),
    AccountAgeWitness(AccountAgeWitness),
    SignedWitness(SignedWitness),
}

impl PersistableNetworkPayload {
    pub fn kind(&self) -> PersistableKind {
        match self {
            Self::TradeStatistics(_) => PersistableKind::TradeStatistics,
            Self::AccountAgeWitness(_) => PersistableKind::AccountAgeWitness,
            Self::SignedWitness(_) => PersistableKind::SignedWitness,
        }
    }

    /// Content key. Account age witnesses carry their own hash; the other
    /// kinds hash their canonical encoding.
    pub fn hash(&self) -> StorageByteArray {
        match self {
            Self::AccountAgeWitness(w) => StorageByteArray::new(w.hash.clone()),
            Self::SignedWitness(w) => StorageByteArray::from(hash_of(w)),
            Self::TradeStatistics(t) => StorageByteArray::from(hash_of(t)),
        }
    }

    pub fn verify_hash_size(&self) -> bool {
        self.hash().len() == PAYLOAD_HASH_SIZE
    }

    pub fn date(&self) -> i64 {
        match self {
            Self::TradeStatistics(t) => t.date,
            Self::AccountAgeWitness(w) => w.date,
            Self::SignedWitness(w) => w.date,
        }
    }

    /// Every append-only kind here is date tolerant: a payload dated too far
    /// from our clock is refused when it arrives from the network.
    pub fn is_date_in_tolerance(&self, now_millis: i64) -> bool {
        now_millis.abs_diff(self.date()) <= DATE_TOLERANCE.as_millis() as u64
    }

    pub fn priority(&self) -> GetDataResponsePriority {
        match self {
            Self::TradeStatistics(_) => GetDataResponsePriority::Low,
            Self::AccountAgeWitness(_) | Self::SignedWitness(_) => GetDataResponsePriority::Mid,
        }
    }

    pub fn date_sortable(&self) -> Option<DateSortable> {
        match self {
            Self::TradeStatistics(t) => Some(DateSortable {
                date: t.date,
                max_items: TRADE_STATISTICS_MAX_ITEMS,
            }),
            _ => None,
        }
    }

    pub fn required_capabilities(&self) -> Option<Capabilities> {
        match self {
            Self::TradeStatistics(_) => Some(Capabilities::single(Capability::TradeStatistics)),
            Self::SignedWitness(_) => Some(Capabilities::single(Capability::SignedAccountAgeWitness)),
            Self::AccountAgeWitness(_) => None,
        }
    }
}

impl AccountAgeWitness {
    /// Witness for an account identified by opaque `account_data`.
    pub fn for_account(account_data: &[u8], date: i64) -> Self {
        Self {
            hash: hash(account_data).to_vec(),
            date,
        }
    }
}
