//! Small shared enums used across the command, session and crypto
//! modules: each cross-cutting concept gets its own tiny type rather
//! than a bare integer.

/// A Calypso secure-session write access level. Determines which
/// SAM/asymmetric key is diversified for the session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AccessLevel {
    /// Personalization-level access (highest privilege).
    Personalization,
    /// Loading-level access (used for SV reload).
    Load,
    /// Debit-level access (used for SV debit/undebit and everyday use).
    Debit,
}

impl AccessLevel {
    /// The KVC index Calypso uses to select the default key for this
    /// level, per the session-opening P1 byte layout.
    pub fn session_open_p1(self) -> u8 {
        match self {
            AccessLevel::Personalization => 0x00,
            AccessLevel::Load => 0x01,
            AccessLevel::Debit => 0x02,
        }
    }
}

/// File organisation of an `ElementaryFile`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileType {
    /// Simple linear records, no wraparound.
    Linear,
    /// Cyclic records: writes wrap around to record 1 after the last.
    Cyclic,
    /// Flat binary blob, addressed by byte offset.
    Binary,
    /// Counter file: each "record" is a 3-byte big-endian counter.
    Counters,
}

/// Which Stored-Value purse operation an `SV_GET` is preparing for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SvOperation {
    /// Credit the purse (`SV_RELOAD`).
    Reload,
    /// Debit the purse (`SV_DEBIT`).
    Debit,
}

/// Whether an SV modifying command actually commits, or merely checks
/// preconditions without mutating the purse.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SvAction {
    /// Perform the operation for real.
    Do,
    /// Dry-run: validate preconditions only.
    Check,
}

/// Whether the physical channel should be kept open for a follow-up
/// transaction, or closed, after `process_commands` returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelControl {
    /// Keep the channel open.
    KeepOpen,
    /// Close the channel after this call.
    CloseAfter,
}
