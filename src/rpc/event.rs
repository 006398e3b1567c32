use serde::Deserialize;
use serde_json::Number;

use crate::core::Transaction;
use crate::core::tx::{parse_base_units, scale_base_units, timestamp_from_millis};
use crate::error::ParseError;

/// A contract event as delivered by the feed, schema-checked at decode time.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub block_number: u64,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub block_timestamp: i64,
    #[serde(default, alias = "event")]
    pub result: TransferFields,
    #[serde(default, rename = "_unconfirmed")]
    pub unconfirmed: bool,
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferFields {
    pub from: Option<AddressField>,
    pub to: Option<AddressField>,
    pub value: Option<AmountField>,
}

/// Addresses arrive either as a plain string or as an encoded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddressField {
    Plain(String),
    Encoded {
        #[serde(default)]
        base58: Option<String>,
        #[serde(default)]
        hex: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AmountField {
    Text(String),
    Number(Number),
}

impl AddressField {
    fn resolve(&self, field: &'static str) -> Result<String, ParseError> {
        let invalid = |reason: &str| ParseError::InvalidAddress {
            field,
            reason: reason.to_string(),
        };
        match self {
            AddressField::Plain(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Err(ParseError::MissingField(field));
                }
                Ok(s.to_string())
            }
            AddressField::Encoded { base58: Some(b58), .. } if !b58.trim().is_empty() => {
                Ok(b58.trim().to_string())
            }
            AddressField::Encoded { hex: Some(hex), .. } => {
                let digits = hex.trim().trim_start_matches("0x");
                if !(digits.len() == 40 || digits.len() == 42) {
                    return Err(invalid("hex form must be 40 or 42 digits"));
                }
                if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid("hex form contains non-hex characters"));
                }
                Ok(format!("0x{}", digits.to_ascii_lowercase()))
            }
            AddressField::Encoded { .. } => Err(invalid("object carries no address form")),
        }
    }
}

impl AmountField {
    fn base_units(&self) -> Result<u128, ParseError> {
        match self {
            AmountField::Text(s) => {
                parse_base_units(s).ok_or_else(|| ParseError::InvalidAmount(s.clone()))
            }
            AmountField::Number(n) => {
                if let Some(v) = n.as_u64() {
                    return Ok(u128::from(v));
                }
                match n.as_f64() {
                    Some(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f < u128::MAX as f64 => {
                        Ok(f as u128)
                    }
                    _ => Err(ParseError::InvalidAmount(n.to_string())),
                }
            }
        }
    }
}

/// Turns transfer events of one token contract into transactions.
#[derive(Debug, Clone)]
pub struct TransferParser {
    event_name: String,
    contract: String,
}

impl TransferParser {
    pub fn new(event_name: &str, contract: &str) -> Self {
        Self {
            event_name: event_name.to_string(),
            contract: contract.trim().to_lowercase(),
        }
    }

    pub fn parse(&self, event: &RawEvent) -> Result<Transaction, ParseError> {
        if event.event_name != self.event_name {
            return Err(ParseError::NotTransfer(event.event_name.clone()));
        }
        if event.contract_address.trim().to_lowercase() != self.contract {
            return Err(ParseError::ForeignContract(event.contract_address.clone()));
        }
        if event.removed {
            return Err(ParseError::Removed);
        }

        let fields = &event.result;
        let from = fields
            .from
            .as_ref()
            .ok_or(ParseError::MissingField("from"))?
            .resolve("from")?;
        let to = fields
            .to
            .as_ref()
            .ok_or(ParseError::MissingField("to"))?
            .resolve("to")?;
        let value = fields.value.as_ref().ok_or(ParseError::MissingField("value"))?;
        let base_units = value.base_units()?;
        let amount = scale_base_units(base_units)
            .ok_or_else(|| ParseError::InvalidAmount(base_units.to_string()))?;
        let timestamp = timestamp_from_millis(event.block_timestamp)
            .ok_or(ParseError::MissingField("block_timestamp"))?;

        Ok(Transaction {
            hash: event.transaction_id.clone(),
            block_number: event.block_number,
            timestamp,
            from,
            to,
            amount,
            contract: event.contract_address.clone(),
            confirmed: !event.unconfirmed,
        })
    }
}
