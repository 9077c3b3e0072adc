//! Synthesizes PTR records from forward-resolution telemetry and publishes
//! them into a DNS Response Policy Zone served by a cooperating nameserver.
//!
//! Telemetry arrives as JSON datagrams (one observation per datagram) in
//! the shape the dnstap agents emit:
//!
//!   {"address": "10.0.0.224", "chain": ["sophia.m3047.", "docs.m3047."]}
//!
//! At startup the RPZ is transferred with AXFR to rebuild context; from
//! then on decisions flow back as DNS UPDATE messages. Try:
//!
//!   dig @127.0.0.1 -x 10.0.0.224

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::exit;
use std::rc::Rc;

mod config;
mod console;
mod db;
mod error;
mod heuristic;
mod logger;
mod rpz;
mod stats;

const MAX_READ_SIZE: usize = 4096;

fn bind_listener(listener: &config::ListenerConfig) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket: std::net::UdpSocket = match (listener.address, listener.interface) {
        (IpAddr::V4(group), Some(interface)) if group.is_multicast() => {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            let any = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), listener.port);
            socket.bind(&any.into())?;
            socket.join_multicast_v4(&group, &interface)?;
            socket.into()
        }
        _ => {
            let domain = if listener.address.is_ipv4() {
                Domain::IPV4
            } else {
                Domain::IPV6
            };
            let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
            socket.bind(&SocketAddr::new(listener.address, listener.port).into())?;
            socket.into()
        }
    };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Fetch the configuration
    let config_path = config::Config::config_file_path();
    let bytes = match std::fs::read(&config_path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to read config file at path {}: {}", config_path, e);
            exit(1);
        }
    };
    let config = match config::Config::try_from(&bytes) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to parse config file at path {}: {}", config_path, e);
            exit(1);
        }
    };

    // Initialize the custom logger
    logger::Logger::new()
        .with_level(config.log.level)
        .with_stderr(config.log.stderr)
        .with_stats(config.stats.is_some())
        .init()
        .expect("Failed to initialize custom logger");

    match &config.listener.interface {
        Some(interface) => log::info!(
            target: "agent",
            "starting. multicast group: {}:{}  listening on: {}  rpz: {}",
            config.listener.address, config.listener.port, interface, config.rpz.zone
        ),
        None => log::info!(
            target: "agent",
            "starting. listening on: {}:{}  rpz: {}",
            config.listener.address, config.listener.port, config.rpz.zone
        ),
    }

    let socket = match bind_listener(&config.listener) {
        Ok(socket) => socket,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("Permission denied! (do you need root?)");
            exit(1);
        }
        Err(e) => {
            eprintln!("{} (did you supply a local address and port?)", e);
            exit(1);
        }
    };
    let socket = match tokio::net::UdpSocket::from_std(socket) {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("Failed to register the listener socket: {}", e);
            exit(1);
        }
    };

    // Everything shares one executor; tasks yield only at suspension
    // points, so the in-memory structures need no locking.
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let statistics = config.stats.map(|_| Rc::new(stats::StatisticsFactory::new()));
            let stop = db::Stop::new();

            let rpz = match rpz::Rpz::new(
                config.rpz.server,
                &config.rpz.zone,
                config.address_records.clone(),
                Some(rpz::warn_garbage()),
                statistics.as_deref(),
            ) {
                Ok(rpz) => rpz,
                Err(e) => {
                    eprintln!("Invalid RPZ zone {}: {}", config.rpz.zone, e);
                    exit(1);
                }
            };
            let agent = db::Agent::new(
                config.cache_size,
                config.telemetry_id.clone(),
                heuristic::for_choice(config.heuristic),
                rpz.clone(),
                stop.clone(),
                statistics.as_deref(),
            );

            // Load the context with AXFR before anything else is queued.
            rpz.enqueue_axfr();
            tokio::task::spawn_local(rpz.clone().run(agent.associations.clone(), stop.clone()));

            let ingress = agent.clone();
            tokio::task::spawn_local(async move {
                let mut buffer = vec![0u8; MAX_READ_SIZE];
                loop {
                    match socket.recv_from(&mut buffer).await {
                        Ok((received, peer)) => {
                            ingress.process_telemetry(&buffer[..received], peer)
                        }
                        Err(e) => log::warn!(target: "telemetry", "recv failed: {}", e),
                    }
                }
            });

            if let Some(console_config) = &config.console {
                let listener = match tokio::net::TcpListener::bind((
                    console_config.host,
                    console_config.port,
                ))
                .await
                {
                    Ok(listener) => listener,
                    Err(e) => {
                        eprintln!(
                            "Failed to bind console to {}:{}: {}",
                            console_config.host, console_config.port, e
                        );
                        exit(1);
                    }
                };
                tokio::task::spawn_local(console::Console::new(agent.clone()).run(listener));
            }

            if let (Some(factory), Some(period)) = (statistics.clone(), config.stats) {
                tokio::task::spawn_local(stats::report_loop(factory, period));
            }

            let scheduler = agent.clone();
            tokio::task::spawn_local(async move { scheduler.run().await });

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!(target: "agent", "shutting down");
                }
                _ = stop.wait() => {
                    log::error!(target: "agent", "stopped on internal error");
                }
            }
        })
        .await;
}
