use arc_swap::ArcSwap;
use hookrelay::router::AppState;
use hookrelay::{config, hook, logging, router};
use hyper::{
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Server,
};
use std::{convert::Infallible, env, process, sync::Arc};

#[tokio::main]
async fn main() {
    let cfg_path = env::args().nth(1).unwrap_or_else(|| {
        eprintln!(
            "usage: {} your_config_file.toml",
            env::args().next().unwrap()
        );
        process::exit(1);
    });
    let cfg = match config::from_file(&cfg_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let registry = match config::load_registry(&cfg) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to load hook definitions: {e}");
            process::exit(1);
        }
    };

    logging::init_logging();

    let addr = cfg.socket;
    let url_prefix = cfg.url_prefix.clone();
    let state = Arc::new(AppState {
        registry: Arc::new(ArcSwap::from_pointee(registry)),
        url_prefix,
    });

    spawn_reload_handler(cfg_path.clone(), state.registry.clone());

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let remote_addr = conn.remote_addr();
        let log = logging::log_context(&remote_addr);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                let mut log = log.clone();
                async move {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    log.start().req(&req).req_id(&request_id);
                    let res = router::handle(req, remote_addr, &state, request_id).await;
                    log.res(&res).end();
                    logging::info!("{}", log.clf_with_timing());
                    res
                }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    logging::info!("listening on {addr}");
    if let Err(e) = server.await {
        eprintln!("server error: {e}");
        process::exit(1);
    }
}

/// Reloads every configured hook file on SIGHUP, swapping the registry in
/// only if the whole set loads and compiles cleanly; a bad reload is
/// logged and the previous registry stays live.
fn spawn_reload_handler(cfg_path: String, registry: Arc<ArcSwap<hook::HookRegistry>>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    logging::info!("failed to install SIGHUP handler: {e}");
                    return;
                }
            };
            loop {
                hangup.recv().await;
                logging::info!("SIGHUP received, reloading hook definitions");
                match config::from_file(&cfg_path).and_then(|cfg| {
                    config::load_registry(&cfg).map_err(|e| {
                        config::ConfigError::BadConfig(e.to_string())
                    })
                }) {
                    Ok(new_registry) => {
                        registry.store(Arc::new(new_registry));
                        logging::info!("hook definitions reloaded");
                    }
                    Err(e) => {
                        logging::info!("reload failed, keeping previous hook definitions: {e}");
                    }
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (cfg_path, registry);
    }
}
