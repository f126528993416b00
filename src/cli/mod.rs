//! Operator command surface

pub mod commands;
