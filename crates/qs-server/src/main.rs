#![forbid(unsafe_code)]

use qs_config::Config;
use qs_server::Server;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[cfg(all(feature = "mimalloc", not(feature = "jemalloc")))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("quasar: {err}");
            std::process::exit(2);
        }
    };
    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("quasar: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = server.run() {
        eprintln!("quasar: {err}");
        std::process::exit(1);
    }
}
