use std::sync::Arc;

use futures::future::try_join_all;
use log::debug;
use tokio::runtime::Builder;

use echtun::config::{ClientConfig, ClientListeners, Config};
use echtun::ech::{DohEchConfigSource, EchConfigCache};
use echtun::mixed_handler::run_proxy_listener;
use echtun::pool::Pool;
use echtun::port_forward_handler::run_port_forward_listener;
use echtun::ws_server::run_ws_server;

fn print_usage_and_exit(arg0: String) -> ! {
    eprintln!(
        "Usage: {} -l <listen> [-f wss://host/path] [options]\n\
         \n\
         Listen formats:\n\
         \x20 wss://host:port/path             gateway server\n\
         \x20 tcp://listen/target[,...]        TCP forward client\n\
         \x20 proxy://[user:pass@]host:port    SOCKS5+HTTP proxy client\n\
         \n\
         Options: -n <pool size> -token <token> -cidr <ranges> -ip <dial ip>\n\
         \x20        -dns <doh server> -ech <domain> -cert <pem> -key <pem>",
        arg0
    );
    std::process::exit(1);
}

async fn run_client(config: ClientConfig) -> std::io::Result<()> {
    let source = DohEchConfigSource::new(&config.doh_server, &config.ech_domain)?;
    let ech = Arc::new(EchConfigCache::new(Box::new(source)));
    // No listener comes up before an ECH config is cached; there is no
    // fallback dial path without it.
    ech.prepare().await;

    let pool = Pool::new(config.gateway.clone(), ech);
    pool.clone().start();

    match config.listeners {
        ClientListeners::PortForward(rules) => {
            let mut handles = Vec::with_capacity(rules.len());
            for rule in rules {
                let pool = pool.clone();
                handles.push(tokio::spawn(async move {
                    run_port_forward_listener(rule, pool).await
                }));
            }
            for result in try_join_all(handles).await.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, format!("listener panicked: {}", e))
            })? {
                result?;
            }
            Ok(())
        }
        ClientListeners::Proxy {
            listen_address,
            auth,
        } => run_proxy_listener(listen_address, auth, pool).await,
    }
}

fn main() {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    if args.is_empty() {
        print_usage_and_exit(arg0);
    }

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}\n", e);
            print_usage_and_exit(arg0);
        }
    };

    let num_threads = std::cmp::max(
        2,
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    );
    debug!("Runtime threads: {}", num_threads);

    let runtime = Builder::new_multi_thread()
        .worker_threads(num_threads)
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    let result = runtime.block_on(async move {
        match config {
            Config::Server(server_config) => run_ws_server(server_config).await,
            Config::Client(client_config) => run_client(client_config).await,
        }
    });

    if let Err(e) = result {
        eprintln!("Fatal: {}", e);
        std::process::exit(1);
    }
}
