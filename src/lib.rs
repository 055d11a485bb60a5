//! RPKI validation.
//!
//! The _Resource Public Key Infrastructure_ (RPKI) is an application of
//! PKI to Internet routing security. It allows the holder of an IP address
//! prefix to publish cryptographically signed statements about which
//! autonomous system may originate routes for it, allowing the origin of
//! BGP route announcements to be validated.
//!
//! This crate implements a relying party for the RPKI: it keeps a local
//! copy of the published repository data, validates it against a set of
//! configured trust anchors, and maintains the resulting set of validated
//! ROA payloads and BGPsec router keys, including the deltas between
//! successive validation runs that RTR clients are served from.
//!
//! Validation is driven by the [`engine`] module. The resulting data and
//! its history live in [`payload`]. The [`daemon`] module keeps both
//! up-to-date periodically.

pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod log;
pub mod metrics;
pub mod operation;
pub mod output;
pub mod payload;
pub mod tal;
