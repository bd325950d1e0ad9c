#[macro_use]
extern crate tracing;

mod launch;
mod signal;

use launch::RootCommand;

fn main() {
    let root: RootCommand = argh::from_env();

    if let Err(code) = root.run() {
        std::process::exit(code);
    }
}
