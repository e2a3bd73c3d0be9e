use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A token amount held by a box, with the EIP-4 metadata when it is known
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRef {
    pub token_id: String,
    pub amount: i64,
    #[serde(default)]
    pub decimals: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A box spent or issued by a transaction.
///
/// Inputs whose evidence was not supplied only carry their `box_id`;
/// `address` is then `None` and `value` is zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxBox {
    #[serde(default)]
    pub box_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub value: i64,
    #[serde(default, rename = "assets")]
    pub tokens: Vec<TokenRef>,
    /// R4..R9 keyed by name
    #[serde(
        default,
        rename = "additionalRegisters",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub registers: BTreeMap<String, Register>,
}

/// A box register as the explorer renders it, or as the bare hex string
/// the node returns
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Register {
    Rendered {
        #[serde(rename = "serializedValue")]
        serialized_value: String,
        #[serde(default, rename = "sigmaType")]
        sigma_type: Option<String>,
        #[serde(default, rename = "renderedValue")]
        rendered_value: Option<String>,
    },
    Serialized(String),
}

impl Register {
    /// Hex of the serialized sigma constant
    pub fn serialized_value(&self) -> &str {
        match self {
            Register::Rendered {
                serialized_value, ..
            } => serialized_value,
            Register::Serialized(value) => value,
        }
    }
}

pub type InputRef = TxBox;
pub type OutputRef = TxBox;

/// Netted view of a transaction, see [`crate::txdetails::reduce`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub id: String,
    pub inputs: Vec<InputRef>,
    pub outputs: Vec<OutputRef>,
}

/// A transaction record as returned by the explorer, confirmed or from the mempool
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub id: String,
    #[serde(default)]
    pub inclusion_height: Option<u32>,
    #[serde(default)]
    pub num_confirmations: u32,
    #[serde(default, alias = "creationTimestamp")]
    pub timestamp: u64,
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    #[serde(default)]
    pub outputs: Vec<OutputRef>,
}

impl RawTransaction {
    pub fn to_summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

/// What the signer reports about a reduced transaction
#[derive(Clone, Debug, Default)]
pub struct UnsignedTxView {
    pub id: String,
    pub input_box_ids: Vec<String>,
    pub outputs: Vec<OutputRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TxState {
    Cancelled = -1,
    Submitted = 0,
    Waiting = 1,
    ConfirmedUnsecure = 9,
    ConfirmedSecure = 10,
}

impl TxState {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let state = match code {
            -1 => TxState::Cancelled,
            0 => TxState::Submitted,
            1 => TxState::Waiting,
            9 => TxState::ConfirmedUnsecure,
            10 => TxState::ConfirmedSecure,
            _ => return None,
        };
        Some(state)
    }

    pub fn is_final(self) -> bool {
        self == TxState::ConfirmedSecure
    }
}

/// One ledger row per (address, transaction)
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressTransaction {
    pub id: u32,
    pub address: String,
    pub tx_id: String,
    /// `None` while unconfirmed
    pub inclusion_height: Option<u32>,
    /// block time once confirmed, submission time before that (ms)
    pub timestamp: u64,
    pub erg_delta: i64,
    pub message: Option<String>,
    pub state: TxState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressTransactionToken {
    pub id: u32,
    pub address: String,
    pub tx_id: String,
    pub token_id: String,
    pub token_name: String,
    /// negative when spent
    pub token_delta: i64,
    pub decimals: u32,
}
