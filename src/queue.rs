//! Command queue & batcher.
//!
//! Accumulates the commands a caller has `prepare*`d, in order, and
//! groups them into the sub-session batches the secure-session state
//! machine will actually transmit, respecting the session-buffer
//! arithmetic and, when it overflows, either splitting (multiple-session
//! mode) or failing outright.

use crate::card_image::CardImage;
use crate::command::{compute_command_session_buffer_size, Command, CommandKind, CommandRef};
use crate::error::{CalypsoError, ErrorKind, Result};

/// FIFO of commands prepared by the caller since the last flush.
///
/// Ordering guarantee: commands are never
/// reordered. Pushing and draining are the only ways to mutate the
/// queue's contents.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: Vec<Command>,
}

impl CommandQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self { commands: Vec::new() }
    }

    /// Enqueue one more command.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Number of commands currently queued.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The queued commands, in prepare order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Take every queued command, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Read-on-open optimisation: if the very first queued
    /// command is a single-record `READ_RECORDS` and `disabled` is
    /// false, pull it out of the queue and return its `(sfi, record)` so
    /// the caller can fold it into `OPEN_SECURE_SESSION` instead.
    pub fn take_read_on_open(&mut self, disabled: bool) -> Option<(u8, u8)> {
        if disabled || self.commands.is_empty() {
            return None;
        }
        let is_single_read = matches!(
            self.commands[0].command_ref(),
            CommandRef::ReadRecords
        ) && matches!(
            self.commands[0].kind(),
            CommandKind::ReadRecords { .. }
        );
        if !is_single_read {
            return None;
        }
        let removed = self.commands.remove(0);
        match removed.kind() {
            CommandKind::ReadRecords { sfi, first_record } => Some((*sfi, *first_record)),
            _ => unreachable!(),
        }
    }
}

/// One sub-session's worth of command indices into the original batch.
pub type SubSessionPlan = Vec<usize>;

/// Split `commands` into sub-session batches according to the
/// session-buffer arithmetic, starting from `initial_counter` (the
/// card's modifications counter at session open).
///
/// When a modifying command would push the running counter negative:
/// - if `multiple_session_enabled` is false, fails with
///   [`ErrorKind::SessionBufferOverflow`] before any APDU is produced
///   (scenario S3);
/// - otherwise, starts a new sub-session, resetting the counter back to
///   `initial_counter` (mirroring the card resetting its own buffer on
///   re-open).
pub fn plan_sub_sessions(
    card: &CardImage,
    commands: &[Command],
    initial_counter: i32,
    multiple_session_enabled: bool,
) -> Result<Vec<SubSessionPlan>> {
    let mut plans = vec![SubSessionPlan::new()];
    let mut counter = initial_counter;

    for (index, command) in commands.iter().enumerate() {
        if command.uses_session_buffer {
            let cost = compute_command_session_buffer_size(card, command.apdu());
            if counter - cost < 0 {
                if !multiple_session_enabled {
                    return Err(CalypsoError::with_description(
                        ErrorKind::SessionBufferOverflow,
                        format!(
                            "{} would overflow the session buffer ({} bytes/units remaining, multiple-session mode disabled)",
                            command.command_ref().as_str(),
                            counter
                        ),
                    ));
                }
                plans.push(SubSessionPlan::new());
                counter = initial_counter;
            }
            counter -= cost;
        }
        plans.last_mut().expect("at least one plan always exists").push(index);
    }

    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card_image::{CardCapabilities, ProductType};
    use crate::command::file;

    fn card() -> CardImage {
        CardImage::new(
            b"1TIC.ICA".to_vec(),
            [0; 8],
            ProductType::PrimeRev3,
            CardCapabilities::EXTENDED_MODE,
            230,
        )
    }

    #[test]
    fn single_sub_session_when_buffer_suffices() {
        let card = card();
        let commands = vec![file::build_update_record(7, 1, vec![0xAB; 4])];
        let plans = plan_sub_sessions(&card, &commands, 430, false).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0], vec![0]);
    }

    #[test]
    fn overflow_without_multiple_session_fails() {
        let card = card();
        let commands = vec![
            file::build_update_record(7, 1, vec![0xAB; 200]),
            file::build_update_record(7, 2, vec![0xAB; 200]),
            file::build_update_record(7, 3, vec![0xAB; 200]),
        ];
        let err = plan_sub_sessions(&card, &commands, 430, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionBufferOverflow);
    }

    #[test]
    fn overflow_with_multiple_session_splits() {
        let card = card();
        let commands = vec![
            file::build_update_record(7, 1, vec![0xAB; 200]),
            file::build_update_record(7, 2, vec![0xAB; 200]),
            file::build_update_record(7, 3, vec![0xAB; 200]),
        ];
        let plans = plan_sub_sessions(&card, &commands, 430, true).unwrap();
        assert!(plans.len() >= 2);
        let flattened: Vec<usize> = plans.into_iter().flatten().collect();
        assert_eq!(flattened, vec![0, 1, 2]);
    }

    #[test]
    fn read_on_open_extracts_single_read() {
        let mut queue = CommandQueue::new();
        queue.push(crate::command::file::build_read_record(7, 1, false));
        queue.push(file::build_update_record(8, 1, vec![0xAB; 4]));
        let extracted = queue.take_read_on_open(false);
        assert_eq!(extracted, Some((7, 1)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn read_on_open_disabled_keeps_queue_intact() {
        let mut queue = CommandQueue::new();
        queue.push(crate::command::file::build_read_record(7, 1, false));
        let extracted = queue.take_read_on_open(true);
        assert_eq!(extracted, None);
        assert_eq!(queue.len(), 1);
    }
}
