//! Covert-channel tunneling over innocuous-looking carrier protocols.
//!
//! A client and a server cooperate to expose a reliable, encrypted,
//! session-oriented byte pipe whose traffic on the wire looks like
//! ordinary queries and responses of the chosen carrier (DNS, HTTP,
//! ICMP echo or raw TCP).
//!
//! Three pluggable layers glue together: overlays (the application
//! payload source/sink), the SOTP core (a reliable framed transport
//! with sessions, sequencing, retries and polling) and wrappers (codecs
//! hiding a SOTP packet inside a carrier PDU).

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod error;
pub mod message;
pub mod overlay;
pub mod registry;
pub mod sotp;
pub mod wrapper;
