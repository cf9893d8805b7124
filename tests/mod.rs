//! Test suite for hubsync
//!
//! This module organizes all tests

pub mod common;
pub mod integration;
pub mod property;
