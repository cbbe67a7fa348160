/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use colored::Colorize;
use jail_build::BaseDirs;
use jail_build::Jail;
use jail_build::JailConfig;
use nix::sys::stat::Mode;
use tracing_subscriber::prelude::*;

mod cli;
mod usage;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::default()
                .with_writer(std::io::stderr)
                .event_format(
                    tracing_glog::Glog::default()
                        .with_span_context(true)
                        .with_timer(tracing_glog::LocalTime::default()),
                )
                .fmt_fields(tracing_glog::GlogFields::default()),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    std::process::exit(run());
}

fn run() -> i32 {
    // jail population is bulk I/O; stay out of interactive workloads' way
    unsafe {
        libc::nice(20);
    }
    // parse with a zero umask so explicit mode arguments apply verbatim;
    // the executor installs the configured umask before exec
    nix::sys::stat::umask(Mode::empty());

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut debug = 0u32;
    args.retain(|arg| {
        if arg == "--cli-debug" {
            debug += 1;
            false
        } else {
            true
        }
    });

    let cfg = match JailConfig::new(BaseDirs::from_env()) {
        Ok(cfg) => cfg,
        Err(e) => return fail(&e.to_string()),
    };
    let mut jail = match Jail::new(cfg) {
        Ok(jail) => jail,
        Err(e) => return fail(&e.to_string()),
    };

    let queue = match cli::parse(&mut jail, args, debug) {
        Ok(queue) => queue,
        Err(e) => return fail(&e.to_string()),
    };
    if jail.cfg.help || queue.is_empty() {
        eprint!("{}", usage::render());
        return 0;
    }
    match cli::run_queue(&mut jail, queue) {
        Ok(()) => 0,
        Err(e) => fail(&e.to_string()),
    }
}

fn fail(msg: &str) -> i32 {
    eprintln!("{}", msg.red());
    1
}
