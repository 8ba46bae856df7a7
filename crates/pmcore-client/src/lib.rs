#![allow(clippy::needless_range_loop)]

// Client side: replay of unacknowledged commands through pmove.

pub mod cl_pred;
