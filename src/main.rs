use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use camino::Utf8PathBuf;
use clap::{crate_authors, crate_version};
use domain::base::iana::SecurityAlgorithm as SecAlg;
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use uzoned::config::{Config, ZoneConfig};
use uzoned::dnssec::Generated;
use uzoned::http::ipinfo::IpInfoClient;
use uzoned::http::turnstile::Turnstile;
use uzoned::http::App;
use uzoned::names::label_count;
use uzoned::serve::{serve_tcp, serve_tls, serve_udp, Mux, Server, ZoneEntry};
use uzoned::store::TtlStore;
use uzoned::util::{unix_now, RateLimiter};
use uzoned::zones::dnscheck::watch::WatcherHub;
use uzoned::zones::dnscheck::DnscheckZone;
use uzoned::zones::{
    challenges, cname, dynaddr, ip, myaddr, status, Addrs, Generator, Zone, ZoneAuthority,
};

const MAX_TEMPORARY_CHALLENGES: usize = 10_000;
const MAX_CHALLENGES_UPDATE_RATE: u32 = 100;
const MAX_DNSCHECK_WATCHERS: usize = 100;
const MAX_DNSCHECK_LARGE_RESPONSE_RATE: u32 = 10;

fn main() -> ExitCode {
    let mut cmd = clap::Command::new("uzoned")
        .version(crate_version!())
        .author(crate_authors!())
        .arg(
            clap::Arg::new("config")
                .short('c')
                .value_name("file")
                .value_parser(clap::value_parser!(Utf8PathBuf))
                .help("Run with the given configuration file"),
        )
        .arg(
            clap::Arg::new("keygen")
                .short('k')
                .value_name("zone")
                .help("Generate DNSSEC keys for the specified zone and exit"),
        )
        .arg(
            clap::Arg::new("algorithm")
                .short('a')
                .value_name("algorithm")
                .value_parser(clap::value_parser!(u8))
                .default_value("13")
                .help("Use this algorithm number when generating DNSSEC keys"),
        );
    let matches = cmd.clone().get_matches();

    if let Some(zone) = matches.get_one::<String>("keygen") {
        let algorithm = SecAlg::from_int(*matches.get_one::<u8>("algorithm").unwrap());
        return keygen(zone, algorithm);
    }
    let Some(config_path) = matches.get_one::<Utf8PathBuf>("config") else {
        let _ = cmd.print_help();
        return ExitCode::from(2);
    };

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("uzoned couldn't be configured: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = uzoned::log::init(
        config.log_level.as_deref(),
        config.request_log_path.as_deref(),
    ) {
        eprintln!("uzoned couldn't set up logging: {err}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("couldn't start Tokio: {err}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(async {
        match run(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{err}");
                ExitCode::FAILURE
            }
        }
    })
}

/// Generate a KSK/ZSK pair for `zone` and print the delegation material.
fn keygen(zone: &str, algorithm: SecAlg) -> ExitCode {
    let zone = if zone.ends_with('.') {
        zone.to_ascii_lowercase()
    } else {
        format!("{}.", zone.to_ascii_lowercase())
    };
    let now = unix_now();
    let valid_from = now - now % 86400;
    let valid_to = valid_from + 31_536_000; // 1 year
    let generated = match Generated::create(&zone, algorithm, 300, valid_from, valid_to) {
        Ok(generated) => generated,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let signer = &generated.signer;
    let b64 = base64::engine::general_purpose::STANDARD;
    println!(
        "{zone}\t300\tIN\tDS\t{} {} {} {}",
        signer.ksk().key_tag(),
        algorithm.to_int(),
        generated.ds_digest_type,
        generated.ds_digest,
    );
    println!(
        "{zone}\t300\tIN\tDNSKEY\t257 3 {} {}",
        algorithm.to_int(),
        b64.encode(signer.ksk().public_key()),
    );
    println!(
        "{zone}\t300\tIN\tDNSKEY\t256 3 {} {} ;privKey: {}",
        algorithm.to_int(),
        b64.encode(signer.zsk().public_key()),
        b64.encode(generated.zsk_secret.as_bytes()),
    );
    let key_sig = signer.key_sig();
    println!(
        "{zone}\t300\tIN\tRRSIG\tDNSKEY {} {} 300 {} {} {} {zone} {} ;validity: {} - {}",
        algorithm.to_int(),
        label_count(&zone),
        key_sig.expiration(),
        key_sig.inception(),
        key_sig.key_tag(),
        b64.encode(key_sig.signature()),
        key_sig.inception().into_int(),
        key_sig.expiration().into_int(),
    );
    ExitCode::SUCCESS
}

async fn run(config: Config) -> Result<(), String> {
    let addrs = Addrs::from_ips(&config.response_addrs);
    let self_challenge_target = config
        .internal_challenge_target
        .as_deref()
        .map(|t| t.to_ascii_lowercase());

    // persistent data store
    let persistent = Arc::new(TtlStore::new());
    if let Some(path) = &config.database_path {
        persistent
            .load_file(path)
            .map_err(|err| format!("cannot load database '{path}': {err}"))?;
        let store = persistent.clone();
        let path = path.clone();
        tokio::spawn(async move {
            store
                .write_file_periodically(path, Duration::from_secs(60))
                .await;
        });
    }
    let store = persistent.clone();
    tokio::spawn(async move { store.prune_periodically(Duration::from_secs(3600)).await });

    // temporary challenge record store
    let challenge_store = Arc::new(TtlStore::with_max_size(MAX_TEMPORARY_CHALLENGES));
    let store = challenge_store.clone();
    tokio::spawn(async move { store.prune_periodically(Duration::from_secs(60)).await });

    let watchers = Arc::new(WatcherHub::new(MAX_DNSCHECK_WATCHERS));
    let requests = Arc::new(AtomicU64::new(0));
    let large_response_limiter = Arc::new(RateLimiter::new(
        MAX_DNSCHECK_LARGE_RESPONSE_RATE,
        MAX_DNSCHECK_LARGE_RESPONSE_RATE,
    ));
    let ipinfo = config
        .ipinfo_base_url
        .clone()
        .map(|url| Arc::new(IpInfoClient::new(url)));

    let mut mux = Mux::new();

    // status zone; not delegated anywhere
    mux.insert(
        "status.",
        ZoneEntry::Standard(Zone {
            authority: ZoneAuthority::new("status.".into(), vec!["invalid.".into()], None),
            static_records: Vec::new(),
            generator: Some(Generator::Status(status::Generator::new(
                requests.clone(),
                challenge_store.clone(),
                watchers.clone(),
            ))),
            updater: None,
            signer: None,
        }),
    );

    for zone_config in &config.dnscheck_zones {
        let zone = zone_config.canonical_zone();
        let signer = zone_config.signer().map_err(|err| err.to_string())?;
        let bad_signer = match &signer {
            Some(signer) => Some(
                signer
                    .generate_bad_twin()
                    .map_err(|err| format!("{zone}: {err}"))?,
            ),
            None => None,
        };
        mux.insert(
            &zone,
            ZoneEntry::Dnscheck(Box::new(DnscheckZone {
                authority: ZoneAuthority::new(
                    zone.clone(),
                    zone_config.canonical_ns(),
                    zone_config.canonical_hostmaster(),
                ),
                addrs: addrs.clone(),
                self_challenge_target: self_challenge_target.clone(),
                static_records: zone_config
                    .parsed_static_records()
                    .map_err(|err| err.to_string())?,
                large_response_limiter: large_response_limiter.clone(),
                watchers: watchers.clone(),
                ipinfo: ipinfo.clone(),
                signer,
                bad_signer,
            })),
        );
    }

    for zone_config in &config.cname_zones {
        let generator = Generator::Cname(cname::Generator {
            addrs: addrs.clone(),
        });
        insert_standard_zone(&mut mux, zone_config, generator, None)?;
    }
    if let Some(zone_config) = &config.challenges_zone {
        let generator = Generator::Challenges(challenges::Generator {
            addrs: addrs.clone(),
            self_challenge_target: self_challenge_target.clone(),
            challenge_store: challenge_store.clone(),
        });
        insert_standard_zone(&mut mux, zone_config, generator, None)?;
    }
    if let Some(zone_config) = &config.dyn_zone {
        let generator = Generator::Dyn(dynaddr::Generator {
            addrs: addrs.clone(),
            self_challenge_target: self_challenge_target.clone(),
            data_store: persistent.clone(),
        });
        insert_standard_zone(&mut mux, zone_config, generator, None)?;
    }
    if let Some(zone_config) = &config.ip_zone {
        let zone = zone_config.canonical_zone();
        let generator = Generator::Ip(ip::Generator {
            addrs: addrs.clone(),
            challenge_store: challenge_store.clone(),
        });
        let updater = ip::UpdateHandler::new(
            &zone,
            challenge_store.clone(),
            RateLimiter::new(MAX_CHALLENGES_UPDATE_RATE, MAX_CHALLENGES_UPDATE_RATE),
        );
        insert_standard_zone(&mut mux, zone_config, generator, Some(updater))?;
    }
    for zone_config in &config.myaddr_zones {
        let generator = Generator::Myaddr(myaddr::Generator {
            addrs: addrs.clone(),
            self_challenge_target: self_challenge_target.clone(),
            data_store: persistent.clone(),
            challenge_store: challenge_store.clone(),
            key_prefix: "myaddr:".into(),
        });
        insert_standard_zone(&mut mux, zone_config, generator, None)?;
    }

    let server = Arc::new(Server {
        mux,
        requests: requests.clone(),
    });

    // dns listeners
    info!("starting dns udp listener");
    let udp = UdpSocket::bind("[::]:53")
        .await
        .map_err(|err| format!("cannot bind udp :53: {err}"))?;
    tokio::spawn(serve_udp(server.clone(), udp));

    info!("starting dns tcp listener");
    let tcp = TcpListener::bind("[::]:53")
        .await
        .map_err(|err| format!("cannot bind tcp :53: {err}"))?;
    tokio::spawn(serve_tcp(server.clone(), tcp));

    if let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) {
        info!("starting dns over tls listener");
        let acceptor = tls_acceptor(cert_path.as_str(), key_path.as_str())?;
        let tls = TcpListener::bind("[::]:853")
            .await
            .map_err(|err| format!("cannot bind tcp :853: {err}"))?;
        tokio::spawn(serve_tls(server.clone(), tls, acceptor));
    }

    // http socket listener
    if let Some(socket_path) = &config.http_socket_path {
        info!("starting http socket listener");
        let app = Arc::new(App {
            persistent: persistent.clone(),
            challenges: challenge_store.clone(),
            challenges_zone: config
                .challenges_zone
                .as_ref()
                .map(ZoneConfig::canonical_zone),
            dyn_zone: config.dyn_zone.as_ref().map(ZoneConfig::canonical_zone),
            myaddr_prefix: "myaddr:".into(),
            turnstile: config
                .myaddr_turnstile_secret
                .clone()
                .map(Turnstile::new),
            watchers: watchers.clone(),
            lookup_upstream: config.lookup_upstream.clone(),
        });
        let router = uzoned::http::router(app);
        let socket_path = socket_path.clone();
        tokio::spawn(async move {
            if let Err(err) = uzoned::http::serve_unix(&socket_path, router).await {
                error!("http listener failed: {err}");
            }
        });
    }

    // all tasks are running; wait for a shutdown signal
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|err| format!("cannot listen for SIGTERM: {err}"))?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("exiting");
    if let Some(path) = &config.database_path {
        if let Err(err) = persistent.write_file(path) {
            error!("final snapshot failed: {err}");
        }
    }
    Ok(())
}

fn insert_standard_zone(
    mux: &mut Mux,
    zone_config: &ZoneConfig,
    generator: Generator,
    updater: Option<ip::UpdateHandler>,
) -> Result<(), String> {
    let zone = zone_config.canonical_zone();
    let signer = zone_config.signer().map_err(|err| err.to_string())?;
    mux.insert(
        &zone,
        ZoneEntry::Standard(Zone {
            authority: ZoneAuthority::new(
                zone.clone(),
                zone_config.canonical_ns(),
                zone_config.canonical_hostmaster(),
            ),
            static_records: zone_config
                .parsed_static_records()
                .map_err(|err| err.to_string())?,
            generator: Some(generator),
            updater,
            signer,
        }),
    );
    Ok(())
}

fn tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, String> {
    use tokio_rustls::rustls;

    let _ = rustls::crypto::ring::default_provider().install_default();
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_path).map_err(|err| format!("cannot open '{cert_path}': {err}"))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|err| format!("cannot parse '{cert_path}': {err}"))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path).map_err(|err| format!("cannot open '{key_path}': {err}"))?,
    ))
    .map_err(|err| format!("cannot parse '{key_path}': {err}"))?
    .ok_or_else(|| format!("no private key in '{key_path}'"))?;
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| format!("bad tls key material: {err}"))?;
    tls_config.alpn_protocols = vec![b"dot".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
