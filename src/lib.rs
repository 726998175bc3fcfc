#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

//! # Getting started
//!
//! Most of this crate's functionality is reached through
//! [`TransactionManager`], the public façade over a Calypso secure
//! session: build a [`CardImage`] from a prior card-selection step, a
//! shared [`SecuritySetting`], a [`crypto::SymmetricCryptoProvider`]
//! backed by a SAM, and a [`transport::ReaderTransport`], then drive it
//! through `prepare_*` calls followed by [`TransactionManager::process_commands`].
//!
//! # Example
//!
//! ```ignore
//! use calypso_core::{CardImage, SecuritySettingBuilder, TransactionManager};
//!
//! let mut manager = TransactionManager::new(card, settings, Box::new(sam), Box::new(transport));
//! manager
//!     .prepare_open_secure_session(calypso_core::types::AccessLevel::Personalization)?
//!     .prepare_read_record(0x07, 1)?
//!     .prepare_close_secure_session()?
//!     .process_commands(true)?;
//! ```

pub mod apdu;
pub mod card_image;
pub mod command;
pub mod crypto;
pub mod error;
pub mod queue;
pub mod security_setting;
pub mod session;
pub mod transaction_manager;
pub mod transport;
pub mod types;

pub use crate::{
    card_image::{CardCapabilities, CardImage},
    error::{AuditEntry, CalypsoError, ErrorKind, Result},
    security_setting::{SecuritySetting, SecuritySettingBuilder},
    transaction_manager::TransactionManager,
    types::{AccessLevel, ChannelControl, FileType, SvAction, SvOperation},
};
