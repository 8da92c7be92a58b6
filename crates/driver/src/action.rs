//! Pending work of the class driver
//!
//! The driver advances through a fixed pipeline of [`Action`]s. Each handler
//! completes its own action and may raise one of the successors allowed by
//! [`Action::successors`]. Detach or shutdown overrides whatever is pending
//! with the close path.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::DriverError;

/// One unit of pending driver work, ordered by dispatch priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Open,
    GetDeviceInfo,
    GetDeviceDescriptor,
    GetConfigDescriptor,
    GetStringDescriptors,
    ClaimInterface,
    ControlTransfer,
    Poll,
    Close,
    Exit,
}

impl Action {
    /// Every action in dispatch order
    pub const ALL: [Action; 10] = [
        Action::Open,
        Action::GetDeviceInfo,
        Action::GetDeviceDescriptor,
        Action::GetConfigDescriptor,
        Action::GetStringDescriptors,
        Action::ClaimInterface,
        Action::ControlTransfer,
        Action::Poll,
        Action::Close,
        Action::Exit,
    ];

    /// Actions a handler of `self` may raise when it completes
    pub fn successors(self) -> &'static [Action] {
        match self {
            Action::Open => &[Action::GetDeviceInfo],
            Action::GetDeviceInfo => &[Action::GetDeviceDescriptor],
            Action::GetDeviceDescriptor => &[Action::GetConfigDescriptor],
            Action::GetConfigDescriptor => &[Action::GetStringDescriptors],
            Action::GetStringDescriptors => &[Action::ClaimInterface],
            Action::ClaimInterface => &[Action::ControlTransfer],
            Action::ControlTransfer => &[Action::Poll],
            Action::Poll => &[],
            Action::Close => &[Action::Exit],
            Action::Exit => &[],
        }
    }

    /// `self` and everything reachable from it through successors
    pub fn forward_reachable(self) -> Vec<Action> {
        let mut reachable = vec![self];
        let mut frontier = vec![self];
        while let Some(action) = frontier.pop() {
            for next in action.successors() {
                if !reachable.contains(next) {
                    reachable.push(*next);
                    frontier.push(*next);
                }
            }
        }
        reachable.sort();
        reachable
    }

    /// Part of enumeration, transfer or polling of an open device
    pub fn is_pipeline(self) -> bool {
        !matches!(self, Action::Close | Action::Exit)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Open => "OPEN",
            Action::GetDeviceInfo => "GET_DEV_INFO",
            Action::GetDeviceDescriptor => "GET_DEV_DESC",
            Action::GetConfigDescriptor => "GET_CONFIG_DESC",
            Action::GetStringDescriptors => "GET_STR_DESC",
            Action::ClaimInterface => "CLAIM_INTF",
            Action::ControlTransfer => "TRANSFER_CONTROL",
            Action::Poll => "TRANSFER",
            Action::Close => "CLOSE",
            Action::Exit => "EXIT",
        };
        f.write_str(name)
    }
}

/// Set of pending actions
///
/// Holds at most one pipeline action, plus the close path. Raising an action
/// that is already pending is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingActions {
    pending: BTreeSet<Action>,
}

impl PendingActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, action: Action) -> bool {
        self.pending.contains(&action)
    }

    /// Pending actions in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = Action> + '_ {
        self.pending.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<Action> {
        self.iter().collect()
    }

    /// Start enumeration of a newly attached device
    ///
    /// Ignored while other work is pending.
    pub fn raise_open(&mut self) {
        if self.pending.is_empty() {
            self.pending.insert(Action::Open);
        }
    }

    /// Replace `from` with its successor `to`
    ///
    /// Does nothing if `from` is no longer pending (a detach superseded it).
    pub fn advance(&mut self, from: Action, to: Action) -> Result<(), DriverError> {
        if !from.successors().contains(&to) {
            return Err(DriverError::InvalidTransition { from, to });
        }
        if self.pending.remove(&from) {
            self.pending.insert(to);
        }
        Ok(())
    }

    /// Finish `action` without a successor
    pub fn complete(&mut self, action: Action) {
        self.pending.remove(&action);
    }

    /// Discard everything and schedule the close path
    pub fn force_close(&mut self) {
        self.pending.clear();
        self.pending.insert(Action::Close);
    }

    /// Discard everything and schedule exit
    pub fn force_exit(&mut self) {
        self.pending.clear();
        self.pending.insert(Action::Exit);
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
