use std::process;

use clap::Parser;

#[macro_use]
extern crate log;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Parse command line arguments and run the inference.
fn main() {
    let cli = parser::Cli::parse();

    // ----------------------------- Init logger.
    logger::Logger::init(cli.verbose + u8::from(!cli.quiet));
    cli.serialize();

    // ----------------------------- Validate before touching any file.
    if let Err(e) = cli.validate() {
        error!("{}", e);
        process::exit(1);
    }

    // ----------------------------- Run the inference.
    match sprig_rs::run(&cli) {
        Ok(()) => (),
        Err(e) => {
            error!("{:?}", e);
            process::exit(1);
        }
    };
}
