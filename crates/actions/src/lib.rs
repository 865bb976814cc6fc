//! `Action` aggregate: a unit of work that is `active` until completed or
//! cancelled.

pub mod action;

pub use action::{
    Action, ActionCancelled, ActionCompleted, ActionCreated, ActionEvent, ActionStatus,
    ActionUpdated, CreateActionInput, UpdateActionInput,
};
