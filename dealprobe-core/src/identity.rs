//! Identities on the wire: Filecoin actor addresses, libp2p peer ids, client signatures.
//!
//! The types come from `fvm_shared` and `libp2p-identity`; this module adds the JSON forms the deal
//! filter and reports use, where addresses are strings and signatures are `{"Type", "Data"}`.

use base64::Engine;
use serde::ser::SerializeStruct;
use serde::Serializer;

pub use fvm_shared::address::{Address, Error as AddressError, Protocol as AddressProtocol};
pub use fvm_shared::crypto::signature::{Signature, SignatureType};
pub use libp2p_identity::PeerId;

/// Serializes an address in its text form (`f01000`).
pub fn serialize_address<S: Serializer>(addr: &Address, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(addr)
}

/// Serializes a signature as Lotus does in JSON: the type number and base64 data.
pub fn serialize_signature<S: Serializer>(
    sig: &Signature,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut s = serializer.serialize_struct("Signature", 2)?;
    s.serialize_field("Type", &(sig.sig_type as u8))?;
    s.serialize_field(
        "Data",
        &base64::engine::general_purpose::STANDARD.encode(&sig.bytes),
    )?;
    s.end()
}

/// Signature type for the numeric code Lotus uses in JSON.
pub fn signature_type(code: u8) -> Option<SignatureType> {
    match code {
        1 => Some(SignatureType::Secp256k1),
        2 => Some(SignatureType::BLS),
        _ => None,
    }
}
