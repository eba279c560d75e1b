mod build;
mod commands;
mod parse;
mod store;

pub(crate) use build::run_build;
pub(crate) use commands::dispatch;
pub(crate) use parse::{parse_build_args, parse_keep, BuildArgs};
pub(crate) use store::{
    compare_cmd, export_cmd, runs_cmd, store_gc, store_prune, store_status, verify_cmd,
};
