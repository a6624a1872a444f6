//! # Constellation Geometry Model
//!
//! Clean DTOs that define the CGP wire format.
//! These types cross every boundary: builder ↔ crypto ↔ store ↔ decoder ↔ caller.
//!
//! Design rule: NO lock types, NO cipher state, NO rayon here.
//! This module is pure data: no I/O, no shared state.

pub mod point;
pub mod constellation;
pub mod packet;
pub mod codebook;
pub mod pack;

pub use point::{MediaRef, Point};
pub use constellation::{Constellation, SuperNode};
pub use packet::{
    Packet, Signature, EncryptedAnchor, Meta,
    SPEC_VERSION, EVENT_TAG, META_NAMESPACE, META_MODALITY, SIGNATURE_ALG,
};
pub use codebook::{Codebook, CodebookEntry, Embedder};
pub use pack::{BuilderPack, PackParams, PackStatus, HaltingParams};
