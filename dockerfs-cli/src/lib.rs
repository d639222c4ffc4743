//! Mount/unmount lifecycle, container picker, and status-file bookkeeping
//! for the `dockerfs` CLI — a thin front-end over [`dockerfs::Mount`].

pub mod lifecycle;
pub mod ui;
