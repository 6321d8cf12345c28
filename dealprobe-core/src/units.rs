//! Chain units: token amounts, padded piece sizes, sector sizes, epochs.

use std::fmt;

use fvm_shared::econ::TokenAmount;
use num_bigint::{BigInt, BigUint, Sign};
use num_integer::Integer;
use num_traits::Zero;
use serde::{Serialize, Serializer};

pub use fvm_shared::clock::ChainEpoch;

/// 30-second epochs.
pub const EPOCHS_PER_DAY: ChainEpoch = 2880;

const SIZE_UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
const SHORT_SIZE_UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Renders an amount as FIL with trailing zeros trimmed, e.g. `0 FIL`, `0.5 FIL`, `12 FIL`.
pub fn fil(amount: &TokenAmount) -> String {
    let precision = BigUint::from(10u64.pow(TokenAmount::DECIMALS as u32));
    let (whole, frac) = amount.atto().magnitude().div_rem(&precision);
    let sign = if amount.atto().sign() == Sign::Minus { "-" } else { "" };
    if frac.is_zero() {
        return format!("{sign}{whole} FIL");
    }
    let digits = format!("{:0>width$}", frac.to_string(), width = TokenAmount::DECIMALS);
    format!("{sign}{whole}.{} FIL", digits.trim_end_matches('0'))
}

/// Parses a decimal attoFIL amount (the chain's JSON representation). Negative amounts are refused.
pub fn parse_atto(s: &str) -> Result<TokenAmount, AmountError> {
    let s = s.trim();
    let atto: BigInt = s
        .parse()
        .map_err(|_| AmountError::Unparsable(s.to_string()))?;
    if atto.sign() == Sign::Minus {
        return Err(AmountError::Negative);
    }
    Ok(TokenAmount::from_atto(atto))
}

/// Serializes an amount as its decimal attoFIL string, for JSON documents.
pub fn serialize_atto<S: Serializer>(amount: &TokenAmount, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(amount.atto())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("negative token amount")]
    Negative,
    #[error("unparsable token amount {0:?}")]
    Unparsable(String),
}

/// Padded piece size in bytes (a power of two).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct PaddedPieceSize(pub u64);

impl PaddedPieceSize {
    /// Human-readable size with binary units and four significant digits, e.g. `256 B`, `32 GiB`.
    pub fn size_str(&self) -> String {
        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit + 1 < SIZE_UNITS.len() {
            value /= 1024.0;
            unit += 1;
        }
        format!("{} {}", four_significant(value), SIZE_UNITS[unit])
    }
}

impl fmt::Display for PaddedPieceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.size_str())
    }
}

/// Sector size of a storage provider in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct SectorSize(pub u64);

impl SectorSize {
    /// Compact form used in provider-facing messages, e.g. `32GiB`.
    pub fn short_string(&self) -> String {
        let mut size = self.0;
        let mut unit = 0;
        while size >= 1024 && unit + 1 < SHORT_SIZE_UNITS.len() {
            if size % 1024 != 0 {
                break;
            }
            size /= 1024;
            unit += 1;
        }
        format!("{}{}", size, SHORT_SIZE_UNITS[unit])
    }
}

impl fmt::Display for SectorSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_string())
    }
}

fn four_significant(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (3 - magnitude).max(0) as usize;
    let s = format!("{:.*}", decimals, value);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}
