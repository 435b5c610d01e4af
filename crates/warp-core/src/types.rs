//! Ledger data model: blocks, transactions, tags, network info, checkpoints.
//!
//! Binary fields travel as unpadded base64url strings on the wire and are
//! decoded into [`Base64Url`] at deserialization time. Numeric fields the
//! peers serve as arbitrary-precision decimal strings (or sometimes bare JSON
//! numbers) are decoded into [`Decimal`], which keeps the exact textual form
//! because block hashing commits to those bytes.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::deep_hash::{DeepHashItem, deep_hash};
use crate::error::DecodeError;

/// Unpadded base64url, tolerant of padding on decode.
const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Opaque bytes, rendered as unpadded base64url.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub struct Base64Url(pub Vec<u8>);

impl Base64Url {
    /// Decode a base64url string.
    pub fn decode(s: &str) -> Result<Self, DecodeError> {
        BASE64URL
            .decode(s.as_bytes())
            .map(Self)
            .map_err(|e| DecodeError::InvalidBase64(format!("{s:?}: {e}")))
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Base64Url {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Base64Url {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Base64Url {
    /// Raw UTF-8 bytes of `s`, not a base64 decode. Used for tag names and values.
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl FromStr for Base64Url {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl AsRef<[u8]> for Base64Url {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Base64Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64URL.encode(&self.0))
    }
}

impl fmt::Debug for Base64Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Base64Url({self})")
    }
}

impl Serialize for Base64Url {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Base64Url {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(de::Error::custom)
    }
}

/// Non-negative integer of arbitrary size, kept in its decimal text form.
#[derive(Clone, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct Decimal(String);

impl Decimal {
    /// Parse a decimal string. Only ASCII digits are accepted.
    pub fn parse(s: &str) -> Result<Self, DecodeError> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DecodeError::InvalidDecimal(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value as `u64`, or `None` if it does not fit.
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Default for Decimal {
    fn default() -> Self {
        Self("0".to_string())
    }
}

impl From<u64> for Decimal {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal({})", self.0)
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DecimalVisitor;

        impl Visitor<'_> for DecimalVisitor {
            type Value = Decimal;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or a decimal string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Decimal, E> {
                Decimal::parse(v).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Decimal, E> {
                Ok(Decimal::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Decimal, E> {
                u64::try_from(v)
                    .map(Decimal::from)
                    .map_err(|_| E::custom(format!("negative decimal {v}")))
            }
        }

        deserializer.deserialize_any(DecimalVisitor)
    }
}

/// A name/value pair attached to a transaction or block.
///
/// Both halves are raw bytes; they are usually, but not necessarily, UTF-8.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct Tag {
    pub name: Base64Url,
    pub value: Base64Url,
}

impl Tag {
    /// Build a tag from UTF-8 strings.
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: Base64Url::from(name),
            value: Base64Url::from(value),
        }
    }

    /// Lossy UTF-8 view of the name.
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(self.name.as_bytes()).into_owned()
    }

    /// Lossy UTF-8 view of the value.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(self.value.as_bytes()).into_owned()
    }

    fn deep_hash_item(&self) -> DeepHashItem {
        DeepHashItem::list([
            DeepHashItem::blob(self.name.as_bytes()),
            DeepHashItem::blob(self.value.as_bytes()),
        ])
    }
}

/// Address receiving a block's mining reward.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum RewardAddr {
    /// The miner left the reward unclaimed (wire form `"unclaimed"`).
    #[default]
    Unclaimed,
    Address(Base64Url),
}

impl RewardAddr {
    const UNCLAIMED: &'static str = "unclaimed";

    fn hash_bytes(&self) -> &[u8] {
        match self {
            Self::Unclaimed => Self::UNCLAIMED.as_bytes(),
            Self::Address(addr) => addr.as_bytes(),
        }
    }
}

impl Serialize for RewardAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unclaimed => serializer.serialize_str(Self::UNCLAIMED),
            Self::Address(addr) => addr.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for RewardAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == Self::UNCLAIMED {
            return Ok(Self::Unclaimed);
        }
        Base64Url::decode(&s).map(Self::Address).map_err(de::Error::custom)
    }
}

/// Proof that the miner had access to a recall chunk of the weave.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ProofOfAccess {
    #[serde(default)]
    pub option: Decimal,
    #[serde(default)]
    pub tx_path: Base64Url,
    #[serde(default)]
    pub data_path: Base64Url,
    #[serde(default)]
    pub chunk: Base64Url,
}

/// Exchange rate as a `[dividend, divisor]` pair.
pub type Rate = [Decimal; 2];

/// A block as served by `GET /block/height/{height}`.
///
/// `indep_hash` is the block identifier: the deep hash of every other field
/// (see [`Block::compute_hash`]). `hash` is the mining solution and is an
/// ordinary hashed field.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    #[serde(default)]
    pub nonce: Base64Url,
    #[serde(default)]
    pub previous_block: Base64Url,
    pub timestamp: u64,
    #[serde(default)]
    pub last_retarget: u64,
    #[serde(default)]
    pub diff: Decimal,
    pub height: u64,
    #[serde(default)]
    pub hash: Base64Url,
    pub indep_hash: Base64Url,
    #[serde(default)]
    pub txs: Vec<Base64Url>,
    #[serde(default)]
    pub tx_root: Base64Url,
    #[serde(default)]
    pub wallet_list: Base64Url,
    #[serde(default)]
    pub reward_addr: RewardAddr,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub reward_pool: Decimal,
    #[serde(default)]
    pub weave_size: Decimal,
    #[serde(default)]
    pub block_size: Decimal,
    #[serde(default)]
    pub cumulative_diff: Decimal,
    #[serde(default)]
    pub hash_list_merkle: Base64Url,
    #[serde(default)]
    pub poa: ProofOfAccess,
    #[serde(default)]
    pub usd_to_ar_rate: Option<Rate>,
    #[serde(default)]
    pub scheduled_usd_to_ar_rate: Option<Rate>,
}

impl Block {
    /// The ordered field list the block identifier commits to.
    ///
    /// Every field except `indep_hash`, in declaration order. Absent rates
    /// hash as empty lists so that "missing" and "present" never collide.
    pub fn hashed_fields(&self) -> DeepHashItem {
        let rate = |r: &Option<Rate>| match r {
            Some([a, b]) => DeepHashItem::list([
                DeepHashItem::blob(a.as_str()),
                DeepHashItem::blob(b.as_str()),
            ]),
            None => DeepHashItem::list([]),
        };

        DeepHashItem::list([
            DeepHashItem::blob(self.nonce.as_bytes()),
            DeepHashItem::blob(self.previous_block.as_bytes()),
            DeepHashItem::blob(self.timestamp.to_string()),
            DeepHashItem::blob(self.last_retarget.to_string()),
            DeepHashItem::blob(self.diff.as_str()),
            DeepHashItem::blob(self.height.to_string()),
            DeepHashItem::blob(self.hash.as_bytes()),
            DeepHashItem::list(self.txs.iter().map(|id| DeepHashItem::blob(id.as_bytes()))),
            DeepHashItem::blob(self.tx_root.as_bytes()),
            DeepHashItem::blob(self.wallet_list.as_bytes()),
            DeepHashItem::blob(self.reward_addr.hash_bytes()),
            DeepHashItem::list(self.tags.iter().map(Tag::deep_hash_item)),
            DeepHashItem::blob(self.reward_pool.as_str()),
            DeepHashItem::blob(self.weave_size.as_str()),
            DeepHashItem::blob(self.block_size.as_str()),
            DeepHashItem::blob(self.cumulative_diff.as_str()),
            DeepHashItem::blob(self.hash_list_merkle.as_bytes()),
            DeepHashItem::list([
                DeepHashItem::blob(self.poa.option.as_str()),
                DeepHashItem::blob(self.poa.tx_path.as_bytes()),
                DeepHashItem::blob(self.poa.data_path.as_bytes()),
                DeepHashItem::blob(self.poa.chunk.as_bytes()),
            ]),
            rate(&self.usd_to_ar_rate),
            rate(&self.scheduled_usd_to_ar_rate),
        ])
    }

    /// Recompute the block identifier from its fields.
    pub fn compute_hash(&self) -> Base64Url {
        Base64Url(deep_hash(&self.hashed_fields()).to_vec())
    }

    /// Overwrite `indep_hash` with the recomputed identifier.
    pub fn seal(&mut self) {
        self.indep_hash = self.compute_hash();
    }
}

fn default_format() -> u8 {
    crate::constants::TX_FORMAT
}

/// A transaction as served by `GET /tx/{id}`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    #[serde(default = "default_format")]
    pub format: u8,
    pub id: Base64Url,
    #[serde(default)]
    pub last_tx: Base64Url,
    pub owner: Base64Url,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub target: Base64Url,
    #[serde(default)]
    pub quantity: Decimal,
    /// Inline payload. Empty when the payload is served separately.
    #[serde(default)]
    pub data: Base64Url,
    #[serde(default)]
    pub data_size: Decimal,
    #[serde(default)]
    pub data_root: Base64Url,
    #[serde(default)]
    pub reward: Decimal,
    pub signature: Base64Url,
}

impl Transaction {
    /// First tag whose name equals `name`.
    pub fn tag(&self, name: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.name.as_bytes() == name.as_bytes())
    }

    /// Lossy UTF-8 value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<String> {
        self.tag(name).map(Tag::value_str)
    }

    /// Declared payload size. Saturates for sizes beyond `u64`.
    pub fn declared_data_size(&self) -> u64 {
        self.data_size.as_u64().unwrap_or(u64::MAX)
    }

    /// `true` when the transaction declares a payload it did not inline.
    pub fn has_external_data(&self) -> bool {
        self.data.is_empty() && self.declared_data_size() > 0
    }
}

/// Node status as served by `GET /info`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub release: u64,
    pub height: u64,
    #[serde(default)]
    pub current: Base64Url,
    #[serde(default)]
    pub blocks: u64,
    #[serde(default)]
    pub peers: u64,
    #[serde(default)]
    pub queue_length: u64,
    #[serde(default)]
    pub node_state_latency: u64,
}

/// Last fully processed position of a pipeline component.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Checkpoint {
    pub height: u64,
    pub hash: Base64Url,
}

/// One validated block's worth of transactions, the unit passed between stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub height: u64,
    pub hash: Base64Url,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

impl Payload {
    /// Checkpoint reached once this payload is durably stored.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            height: self.height,
            hash: self.hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // Base64Url / Decimal
    // ------------------------------------------------------------------

    #[test]
    fn base64url_is_unpadded() {
        let b = Base64Url(vec![0xFB, 0xFF]);
        assert_eq!(b.to_string(), "-_8");
        assert_eq!(Base64Url::decode("-_8").unwrap(), b);
        assert_eq!(Base64Url::decode("-_8=").unwrap(), b);
    }

    #[test]
    fn base64url_rejects_standard_alphabet() {
        assert!(Base64Url::decode("+/8").is_err());
    }

    #[test]
    fn decimal_accepts_string_and_number() {
        let a: Decimal = serde_json::from_str("\"123456789012345678901234567890\"").unwrap();
        assert_eq!(a.as_str(), "123456789012345678901234567890");
        assert_eq!(a.as_u64(), None);

        let b: Decimal = serde_json::from_str("42").unwrap();
        assert_eq!(b.as_u64(), Some(42));
    }

    #[test]
    fn decimal_rejects_garbage() {
        assert!(serde_json::from_str::<Decimal>("\"12a\"").is_err());
        assert!(serde_json::from_str::<Decimal>("\"\"").is_err());
        assert!(serde_json::from_str::<Decimal>("-1").is_err());
        assert!(serde_json::from_str::<Decimal>("1.5").is_err());
    }

    // ------------------------------------------------------------------
    // Wire decoding
    // ------------------------------------------------------------------

    #[test]
    fn reward_addr_unclaimed_and_address() {
        let u: RewardAddr = serde_json::from_str("\"unclaimed\"").unwrap();
        assert_eq!(u, RewardAddr::Unclaimed);
        let a: RewardAddr = serde_json::from_str("\"AAEC\"").unwrap();
        assert_eq!(a, RewardAddr::Address(Base64Url(vec![0, 1, 2])));
        assert_eq!(serde_json::to_string(&u).unwrap(), "\"unclaimed\"");
    }

    #[test]
    fn block_decodes_with_defaults() {
        let json = r#"{
            "timestamp": 1700000000,
            "height": 7,
            "indep_hash": "AAAA",
            "previous_block": "AQID",
            "txs": ["AQ", "Ag"],
            "reward_pool": 1000,
            "usd_to_ar_rate": ["1", "5"]
        }"#;
        let block: Block = serde_json::from_str(json).unwrap();
        assert_eq!(block.height, 7);
        assert_eq!(block.txs.len(), 2);
        assert_eq!(block.reward_pool.as_str(), "1000");
        assert_eq!(block.reward_addr, RewardAddr::Unclaimed);
        assert_eq!(block.usd_to_ar_rate.as_ref().map(|r| r[1].as_str()), Some("5"));
        assert!(block.scheduled_usd_to_ar_rate.is_none());
    }

    #[test]
    fn block_rejects_non_decimal_field() {
        let json = r#"{"timestamp": 1, "height": 1, "indep_hash": "AA", "weave_size": "lots"}"#;
        assert!(serde_json::from_str::<Block>(json).is_err());
    }

    #[test]
    fn transaction_tags_and_external_data() {
        let json = format!(
            r#"{{"id": "AQ", "owner": "Ag", "signature": "Aw", "data_size": "300000",
                "tags": [{{"name": "{}", "value": "{}"}}]}}"#,
            Base64Url::from("App-Name"),
            Base64Url::from("SmartWeaveAction"),
        );
        let tx: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx.format, 2);
        assert_eq!(tx.tag_value("App-Name").as_deref(), Some("SmartWeaveAction"));
        assert!(tx.tag("Contract").is_none());
        assert!(tx.has_external_data());
        assert_eq!(tx.declared_data_size(), 300_000);
    }

    // ------------------------------------------------------------------
    // Block hashing
    // ------------------------------------------------------------------

    fn sample_block() -> Block {
        let mut block = Block {
            nonce: Base64Url(vec![1; 8]),
            previous_block: Base64Url(vec![2; 48]),
            timestamp: 1_700_000_000,
            last_retarget: 1_699_999_000,
            diff: Decimal::parse("115792089237316195423570985008687907853269984665640564039457584007913129639935").unwrap(),
            height: 100,
            hash: Base64Url(vec![3; 32]),
            indep_hash: Base64Url::default(),
            txs: vec![Base64Url(vec![4; 32])],
            tx_root: Base64Url(vec![5; 32]),
            wallet_list: Base64Url(vec![6; 48]),
            reward_addr: RewardAddr::Address(Base64Url(vec![7; 32])),
            tags: vec![],
            reward_pool: Decimal::from(1_000),
            weave_size: Decimal::from(2_000),
            block_size: Decimal::from(300),
            cumulative_diff: Decimal::from(99),
            hash_list_merkle: Base64Url(vec![8; 48]),
            poa: ProofOfAccess::default(),
            usd_to_ar_rate: Some([Decimal::from(1), Decimal::from(5)]),
            scheduled_usd_to_ar_rate: None,
        };
        block.seal();
        block
    }

    #[test]
    fn seal_sets_48_byte_identifier() {
        let block = sample_block();
        assert_eq!(block.indep_hash.len(), crate::constants::BLOCK_HASH_SIZE);
        assert_eq!(block.indep_hash, block.compute_hash());
    }

    #[test]
    fn hash_ignores_indep_hash_field() {
        let mut block = sample_block();
        let before = block.compute_hash();
        block.indep_hash = Base64Url(vec![0xFF; 48]);
        assert_eq!(block.compute_hash(), before);
    }

    #[test]
    fn hash_commits_to_rates_and_poa() {
        let block = sample_block();

        let mut rate_changed = block.clone();
        rate_changed.usd_to_ar_rate = Some([Decimal::from(1), Decimal::from(6)]);
        assert_ne!(rate_changed.compute_hash(), block.compute_hash());

        let mut rate_removed = block.clone();
        rate_removed.usd_to_ar_rate = None;
        assert_ne!(rate_removed.compute_hash(), block.compute_hash());

        let mut poa_changed = block.clone();
        poa_changed.poa.chunk = Base64Url(vec![9]);
        assert_ne!(poa_changed.compute_hash(), block.compute_hash());
    }

    #[test]
    fn hash_survives_json_roundtrip() {
        let block = sample_block();
        let json = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.compute_hash(), block.indep_hash);
    }

    #[test]
    fn payload_checkpoint() {
        let p = Payload {
            height: 5,
            hash: Base64Url(vec![1, 2]),
            timestamp: 9,
            transactions: vec![],
        };
        assert_eq!(p.checkpoint(), Checkpoint { height: 5, hash: Base64Url(vec![1, 2]) });
    }
}
