//! # Test Suite for the CAN Asset Tracker
//!
//! End-to-end scenarios that run bytes and frames through the whole pipeline, plus
//! command line handling of the host driver. Unit tests live next to each module.
