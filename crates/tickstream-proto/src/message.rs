//! Message kinds, payload schemas, and field-level validation for the
//! tickstream protocol. The frame codec never looks inside a payload;
//! everything here operates one layer up, on the bytes a decoded
//! [`crate::frame::Frame`] carries.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire type byte values. Assigned once; never renumber a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Auth = 1,
    Subscribe = 2,
    Heartbeat = 3,
    DataBatch = 4,
    Error = 5,
    Ack = 6,
    Pong = 7,
}

impl MessageType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CatalogError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Auth),
            2 => Ok(Self::Subscribe),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::DataBatch),
            5 => Ok(Self::Error),
            6 => Ok(Self::Ack),
            7 => Ok(Self::Pong),
            other => Err(CatalogError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown message type byte: {0}")]
    UnknownType(u8),
    #[error("payload decode failed: {0}")]
    Decode(String),
}

/// Stable wire error codes, carried inside ERROR frame payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidAuth,
    AuthRequired,
    AlreadyAuthenticated,
    InvalidSubscription,
    AlreadySubscribed,
    NotSubscribed,
    HeartbeatTimeout,
    InvalidMessage,
    InvalidMessageType,
    InvalidSequence,
    ChecksumFailed,
    ProtocolVersion,
    MessageTooLarge,
    RateLimited,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            Self::InvalidAuth => "INVALID_AUTH",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AlreadyAuthenticated => "ALREADY_AUTHENTICATED",
            Self::InvalidSubscription => "INVALID_SUBSCRIPTION",
            Self::AlreadySubscribed => "ALREADY_SUBSCRIBED",
            Self::NotSubscribed => "NOT_SUBSCRIBED",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            Self::InvalidSequence => "INVALID_SEQUENCE",
            Self::ChecksumFailed => "CHECKSUM_FAILED",
            Self::ProtocolVersion => "PROTOCOL_VERSION",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionMode {
    Unspecified,
    Second,
    Minute,
}

impl fmt::Display for SubscriptionMode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "UNSPECIFIED"),
            Self::Second => write!(f, "SECOND"),
            Self::Minute => write!(f, "MINUTE"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub mode: SubscriptionMode,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub start_time_ms: Option<i64>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub timestamp_ms: i64,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub price: f64,
    pub volume: f64,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub bid_size: Option<f64>,
    #[serde(default)]
    pub ask_size: Option<f64>,
    pub mode: SubscriptionMode,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBatch {
    pub ticks: Vec<Tick>,
    pub batch_sequence: u64,
    pub batch_timestamp_ms: i64,
    pub is_snapshot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub ack_type: String,
    pub success: bool,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub client_ts: i64,
    pub server_ts: i64,
    pub sequence: u64,
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, CatalogError> {
    serde_json::to_vec(value).map_err(|err| CatalogError::Decode(err.to_string()))
}

pub fn decode_payload<T: for<'de> Deserialize<'de>>(
    bytes: &[u8]
) -> Result<T, CatalogError> {
    serde_json::from_slice(bytes).map_err(|err| CatalogError::Decode(err.to_string()))
}

/// A `(field path, reason)` validation failure for one message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed at `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }
}

const MAX_USERNAME_LEN: usize = 64;
const MAX_PASSWORD_LEN: usize = 128;
const MAX_CLIENT_ID_LEN: usize = 64;
const MAX_SYMBOL_LEN: usize = 16;
const MAX_SYMBOLS: usize = 100;
const MAX_METADATA_ENTRIES: usize = 20;
const MAX_METADATA_KEY_LEN: usize = 64;
const MAX_METADATA_VALUE_LEN: usize = 256;
const MIN_PRICE: f64 = 0.0001;
const MAX_PRICE: f64 = 1_000_000.0;
const MAX_VOLUME: f64 = 1_000_000_000.0;
const TIMESTAMP_PAST_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
const TIMESTAMP_FUTURE_WINDOW_MS: i64 = 5 * 60 * 1000;

fn is_username_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_symbol_char(c: char) -> bool {
    (c.is_ascii_uppercase() || c.is_ascii_digit())
        || c == '.'
        || c == '_'
        || c == '-'
}

fn is_semver_like(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return false;
    }
    parts.iter().all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

fn validate_timestamp(
    field: &str,
    timestamp_ms: i64,
    now_ms: i64,
) -> Result<(), ValidationError> {
    if timestamp_ms <= 0 {
        return Err(ValidationError::new(field, "must be > 0"));
    }
    let lower = now_ms.saturating_sub(TIMESTAMP_PAST_WINDOW_MS);
    let upper = now_ms.saturating_add(TIMESTAMP_FUTURE_WINDOW_MS);
    if timestamp_ms < lower || timestamp_ms > upper {
        return Err(ValidationError::new(
            field,
            format!("out of accepted window [{lower}, {upper}]"),
        ));
    }
    Ok(())
}

fn validate_metadata(
    field: &str,
    metadata: &HashMap<String, String>,
) -> Result<(), ValidationError> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(ValidationError::new(
            field,
            format!("at most {MAX_METADATA_ENTRIES} entries"),
        ));
    }
    for (key, value) in metadata {
        if key.is_empty() {
            return Err(ValidationError::new(field, "key must not be empty"));
        }
        if key.len() > MAX_METADATA_KEY_LEN {
            return Err(ValidationError::new(
                field,
                format!("key exceeds {MAX_METADATA_KEY_LEN} bytes"),
            ));
        }
        if value.len() > MAX_METADATA_VALUE_LEN {
            return Err(ValidationError::new(
                field,
                format!("value exceeds {MAX_METADATA_VALUE_LEN} bytes"),
            ));
        }
    }
    Ok(())
}

pub fn validate_auth_request(req: &AuthRequest) -> Result<(), ValidationError> {
    if req.username.is_empty() || req.username.len() > MAX_USERNAME_LEN {
        return Err(ValidationError::new(
            "username",
            format!("must be 1..{MAX_USERNAME_LEN} bytes"),
        ));
    }
    if !req.username.chars().all(is_username_char) {
        return Err(ValidationError::new(
            "username",
            "must match [A-Za-z0-9_-]+",
        ));
    }
    if req.password.is_empty() || req.password.len() > MAX_PASSWORD_LEN {
        return Err(ValidationError::new(
            "password",
            format!("must be 1..{MAX_PASSWORD_LEN} bytes"),
        ));
    }
    if let Some(client_id) = &req.client_id {
        if client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(ValidationError::new(
                "client_id",
                format!("must be <= {MAX_CLIENT_ID_LEN} bytes"),
            ));
        }
    }
    if let Some(version) = &req.version {
        if !is_semver_like(version) {
            return Err(ValidationError::new(
                "version",
                "must match N.N or N.N.N",
            ));
        }
    }
    Ok(())
}

pub fn validate_subscribe_request(
    req: &SubscribeRequest
) -> Result<(), ValidationError> {
    if matches!(req.mode, SubscriptionMode::Unspecified) {
        return Err(ValidationError::new("mode", "must not be UNSPECIFIED"));
    }
    if let Some(symbols) = &req.symbols {
        if symbols.len() > MAX_SYMBOLS {
            return Err(ValidationError::new(
                "symbols",
                format!("at most {MAX_SYMBOLS} symbols"),
            ));
        }
        for symbol in symbols {
            validate_symbol("symbols[]", symbol)?;
        }
    }
    if let Some(metadata) = &req.metadata {
        validate_metadata("metadata", metadata)?;
    }
    Ok(())
}

fn validate_symbol(
    field: &str,
    symbol: &str,
) -> Result<(), ValidationError> {
    if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN {
        return Err(ValidationError::new(
            field,
            format!("must be 1..{MAX_SYMBOL_LEN} bytes"),
        ));
    }
    if !symbol.chars().all(is_symbol_char) {
        return Err(ValidationError::new(field, "must match [A-Z0-9._-]+"));
    }
    Ok(())
}

pub fn validate_heartbeat_request(
    req: &HeartbeatRequest,
    now_ms: i64,
) -> Result<(), ValidationError> {
    validate_timestamp("timestamp_ms", req.timestamp_ms, now_ms)
}

pub fn validate_tick(
    tick: &Tick,
    now_ms: i64,
) -> Result<(), ValidationError> {
    validate_symbol("symbol", &tick.symbol)?;
    validate_timestamp("timestamp_ms", tick.timestamp_ms, now_ms)?;
    validate_price("price", tick.price)?;
    if !(0.0..=MAX_VOLUME).contains(&tick.volume) {
        return Err(ValidationError::new(
            "volume",
            format!("must be 0..{MAX_VOLUME}"),
        ));
    }
    if let Some(bid) = tick.bid {
        validate_price("bid", bid)?;
    }
    if let Some(ask) = tick.ask {
        validate_price("ask", ask)?;
    }
    if let Some(size) = tick.bid_size {
        if size < 0.0 {
            return Err(ValidationError::new("bid_size", "must be >= 0"));
        }
    }
    if let Some(size) = tick.ask_size {
        if size < 0.0 {
            return Err(ValidationError::new("ask_size", "must be >= 0"));
        }
    }
    if matches!(tick.mode, SubscriptionMode::Unspecified) {
        return Err(ValidationError::new("mode", "must not be UNSPECIFIED"));
    }
    if let Some(metadata) = &tick.metadata {
        validate_metadata("metadata", metadata)?;
    }
    Ok(())
}

fn validate_price(
    field: &str,
    price: f64,
) -> Result<(), ValidationError> {
    if !(MIN_PRICE..=MAX_PRICE).contains(&price) {
        return Err(ValidationError::new(
            field,
            format!("must be {MIN_PRICE}..{MAX_PRICE}"),
        ));
    }
    Ok(())
}

pub fn validate_data_batch(
    batch: &DataBatch,
    now_ms: i64,
) -> Result<(), ValidationError> {
    if batch.ticks.is_empty() || batch.ticks.len() > 1_000 {
        return Err(ValidationError::new("ticks", "must carry 1..1000 ticks"));
    }
    for (idx, tick) in batch.ticks.iter().enumerate() {
        validate_tick(tick, now_ms)
            .map_err(|err| ValidationError::new(format!("ticks[{idx}].{}", err.field), err.reason))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips_stable_values() {
        assert_eq!(MessageType::Auth.as_u8(), 1);
        assert_eq!(MessageType::Subscribe.as_u8(), 2);
        assert_eq!(MessageType::Heartbeat.as_u8(), 3);
        assert_eq!(MessageType::DataBatch.as_u8(), 4);
        assert_eq!(MessageType::Error.as_u8(), 5);
        assert_eq!(MessageType::Ack.as_u8(), 6);
        assert_eq!(MessageType::Pong.as_u8(), 7);
        assert_eq!(MessageType::try_from(3).unwrap(), MessageType::Heartbeat);
        assert_eq!(MessageType::try_from(99), Err(CatalogError::UnknownType(99)));
    }

    #[test]
    fn auth_request_rejects_bad_username_chars() {
        let req = AuthRequest {
            username: "bad user!".to_string(),
            password: "pw".to_string(),
            client_id: None,
            version: None,
        };
        let err = validate_auth_request(&req).unwrap_err();
        assert_eq!(err.field, "username");
    }

    #[test]
    fn auth_request_accepts_semver_version() {
        let req = AuthRequest {
            username: "ok_user".to_string(),
            password: "ok_pass".to_string(),
            client_id: Some("c1".to_string()),
            version: Some("1.0.0".to_string()),
        };
        assert!(validate_auth_request(&req).is_ok());
    }

    #[test]
    fn subscribe_rejects_unspecified_mode() {
        let req = SubscribeRequest {
            mode: SubscriptionMode::Unspecified,
            symbols: None,
            start_time_ms: None,
            metadata: None,
        };
        let err = validate_subscribe_request(&req).unwrap_err();
        assert_eq!(err.field, "mode");
    }

    #[test]
    fn subscribe_rejects_bad_symbol() {
        let req = SubscribeRequest {
            mode: SubscriptionMode::Second,
            symbols: Some(vec!["btc usd".to_string()]),
            start_time_ms: None,
            metadata: None,
        };
        let err = validate_subscribe_request(&req).unwrap_err();
        assert_eq!(err.field, "symbols[]");
    }

    #[test]
    fn heartbeat_rejects_stale_timestamp() {
        let now = 10_000_000_000_i64;
        let req = HeartbeatRequest {
            timestamp_ms: now - (25 * 60 * 60 * 1000),
            sequence: 1,
        };
        assert!(validate_heartbeat_request(&req, now).is_err());
    }

    #[test]
    fn heartbeat_accepts_fresh_timestamp() {
        let now = 10_000_000_000_i64;
        let req = HeartbeatRequest { timestamp_ms: now, sequence: 1 };
        assert!(validate_heartbeat_request(&req, now).is_ok());
    }

    #[test]
    fn tick_validates_price_and_mode() {
        let now = 10_000_000_000_i64;
        let mut tick = Tick {
            symbol: "BTC-USD".to_string(),
            timestamp_ms: now,
            price: 100.0,
            volume: 1.0,
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
            mode: SubscriptionMode::Second,
            metadata: None,
        };
        assert!(validate_tick(&tick, now).is_ok());

        tick.price = 0.0;
        assert!(validate_tick(&tick, now).is_err());
    }

    #[test]
    fn data_batch_rejects_empty_and_oversized() {
        let now = 10_000_000_000_i64;
        let batch = DataBatch {
            ticks: vec![],
            batch_sequence: 1,
            batch_timestamp_ms: now,
            is_snapshot: false,
        };
        assert!(validate_data_batch(&batch, now).is_err());
    }

    #[test]
    fn metadata_rejects_empty_key() {
        let mut metadata = HashMap::new();
        metadata.insert(String::new(), "v".to_string());
        let req = SubscribeRequest {
            mode: SubscriptionMode::Second,
            symbols: None,
            start_time_ms: None,
            metadata: Some(metadata),
        };
        let err = validate_subscribe_request(&req).unwrap_err();
        assert_eq!(err.field, "metadata");
    }
}
