//! DLC CLI - cache docker images layer by layer between CI runs.

pub mod commands;
pub mod output;
pub mod state;
