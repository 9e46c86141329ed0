//! End-to-end recovery scenarios.
//!
//! Each test file covers a specific scenario. Tests write log records the
//! way a running engine would, optionally flush or crash the storage, and
//! then open the environment to check what recovery rebuilt.

#![cfg(test)]

mod helpers;

mod test_apply_errors;
mod test_checkpoint;
mod test_corrupt_log;
mod test_dangling_child;
mod test_redo;
mod test_roots;
mod test_scan_limit;
mod test_undo;
