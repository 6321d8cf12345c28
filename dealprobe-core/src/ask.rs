//! Ask policy: a provider is only usable if it asks nothing on chain and accepts any piece from
//! 256 B up to a full sector.

use fvm_shared::econ::TokenAmount;
use num_traits::Zero;

use crate::protocol::StorageAsk;
use crate::units::{PaddedPieceSize, SectorSize};

/// Required minimum piece size.
pub const MIN_PIECE_SIZE: PaddedPieceSize = PaddedPieceSize(256);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AskViolation {
    #[error("get-ask price has to be set to 0")]
    NonZeroPrice {
        price: TokenAmount,
        verified_price: TokenAmount,
    },
    #[error("get-ask accepting size must be min=256B and max={sector_size}")]
    SizeBounds {
        min: PaddedPieceSize,
        max: PaddedPieceSize,
        sector_size: SectorSize,
    },
}

/// Check a fetched ask against the provider's sector size. Prices are checked first.
pub fn validate_ask(ask: &StorageAsk, sector_size: SectorSize) -> Result<(), AskViolation> {
    if !ask.price.is_zero() || !ask.verified_price.is_zero() {
        return Err(AskViolation::NonZeroPrice {
            price: ask.price.clone(),
            verified_price: ask.verified_price.clone(),
        });
    }
    if ask.min_piece_size != MIN_PIECE_SIZE || ask.max_piece_size.0 != sector_size.0 {
        return Err(AskViolation::SizeBounds {
            min: ask.min_piece_size,
            max: ask.max_piece_size,
            sector_size,
        });
    }
    Ok(())
}
