//! Command dispatch contract.
//!
//! The device manager needs exactly one outgoing command, the hub member
//! query, and reaches it through [`CommandDispatcher`]. The command channel
//! implements it; tests substitute a recorder.

use std::fmt;

use lidarlink_core::CommandSet;

use crate::error::DispatchError;

/// Outcome delivered to a [`CommandCallback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandStatus {
    /// Device acknowledged; the callback receives the ack body
    Success,
    /// No ack within the command timeout
    Timeout,
    /// Datagram could not be sent
    SendFailed,
    /// No command channel for the handle
    NotConnected,
}

impl CommandStatus {
    /// True for [`CommandStatus::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Success)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandStatus::Success => "success",
            CommandStatus::Timeout => "timeout",
            CommandStatus::SendFailed => "send failed",
            CommandStatus::NotConnected => "not connected",
        };
        f.write_str(name)
    }
}

/// Completion callback for one command.
///
/// Invoked exactly once, with the ack body on success and an empty slice
/// otherwise.
pub type CommandCallback = Box<dyn FnOnce(CommandStatus, &[u8]) + Send>;

/// Sends commands to connected devices
pub trait CommandDispatcher: Send + Sync {
    /// Queue one command for `handle`.
    ///
    /// On `Ok` the callback will eventually run exactly once. On `Err` the
    /// callback is dropped without running. Implementations must not block
    /// and must not run the callback before returning.
    fn send_command(
        &self,
        handle: u8,
        command_set: CommandSet,
        command_id: u8,
        payload: Vec<u8>,
        callback: CommandCallback,
    ) -> Result<(), DispatchError>;
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::*;

    /// One command captured by [`RecordingDispatcher`]
    pub struct SentCommand {
        pub handle: u8,
        pub command_set: CommandSet,
        pub command_id: u8,
        pub callback: CommandCallback,
    }

    /// Dispatcher that stores commands for the test to complete by hand
    #[derive(Default)]
    pub struct RecordingDispatcher {
        pub sent: Mutex<Vec<SentCommand>>,
    }

    impl RecordingDispatcher {
        pub fn take(&self) -> Vec<SentCommand> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl CommandDispatcher for RecordingDispatcher {
        fn send_command(
            &self,
            handle: u8,
            command_set: CommandSet,
            command_id: u8,
            _payload: Vec<u8>,
            callback: CommandCallback,
        ) -> Result<(), DispatchError> {
            self.sent.lock().unwrap().push(SentCommand {
                handle,
                command_set,
                command_id,
                callback,
            });
            Ok(())
        }
    }
}
