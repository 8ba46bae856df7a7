#![allow(clippy::too_many_arguments, clippy::float_cmp, clippy::needless_range_loop,
         clippy::collapsible_else_if, clippy::manual_range_contains)]

pub mod q_shared;
pub mod cvar;
pub mod pmove;
pub mod stuck;
pub mod cmodel;
