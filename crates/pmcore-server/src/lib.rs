#![allow(clippy::too_many_arguments, clippy::float_cmp, clippy::needless_range_loop,
         clippy::collapsible_else_if)]

// Server side: the broad-phase entity index and the per-player movement tick.

pub mod sv_user;
pub mod sv_world;
