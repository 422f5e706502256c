use b2bua::application::AdminView;
use b2bua::config::Config;
use b2bua::domain::account::AccountTable;
use b2bua::domain::registry::{MemoryRegistry, Registry};
use b2bua::infrastructure::protocols::sip::{
    CallBridge, ConnectionLossHandler, DigestAuth, Registrar, SipAuthenticator, SipMethod,
    SipServer, SipServerConfig, UserAgent,
};
use b2bua::interface::api::{build_router, init_metrics};
use b2bua::interface::console::Console;
use b2bua::logging;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "b2bua", version, about = "SIP back-to-back user agent and registrar")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run without the interactive console
    #[arg(short = 'n', long)]
    no_console: bool,

    /// Accept REGISTER and INVITE without digest authentication
    #[arg(long)]
    disable_auth: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if args.no_console {
        config.console.enabled = false;
    }
    if args.disable_auth {
        config.auth.enabled = false;
    }

    let logs = Arc::new(logging::init(&config.logging.level)?);
    info!("Starting B2BUA");

    let prometheus_handle = if config.admin.enabled {
        Some(init_metrics()?)
    } else {
        None
    };

    let accounts = Arc::new(AccountTable::new());
    for account in &config.auth.accounts {
        accounts.add_account(&account.username, &account.password).await;
    }
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());

    let bind = config.sip.bind_socket()?;
    let mut sip_server = SipServer::new(SipServerConfig {
        udp_bind: bind,
        tcp_bind: bind,
        domain: config.sip.domain.clone(),
        enable_tcp: config.sip.enable_tcp,
    });
    sip_server.start().await?;

    let port = sip_server
        .udp_local_addr()
        .map(|addr| addr.port())
        .unwrap_or(bind.port());
    let advertised = SocketAddr::new(config.sip.advertised_ip()?, port);
    info!("Advertising {} in Via and Contact", advertised);

    let digest = config.auth.enabled.then(|| {
        info!("Digest authentication enabled, realm {}", config.auth.realm);
        Arc::new(DigestAuth::new(&config.auth.realm, accounts.clone()))
    });
    if let Some(digest) = digest.clone() {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                digest.cleanup_nonces().await;
            }
        });
    }
    let auth = digest.map(|digest| digest as Arc<dyn SipAuthenticator>);

    let (user_agent, mut leg_events) = UserAgent::new(
        Arc::new(sip_server.sender()),
        advertised,
        config.sip.user_agent.clone(),
    );
    let user_agent = Arc::new(match &auth {
        Some(auth) => user_agent.with_auth(auth.clone()),
        None => user_agent,
    });
    let bridge = Arc::new(CallBridge::new(registry.clone(), user_agent.clone()));

    let registrar = Arc::new(match &auth {
        Some(auth) => Registrar::with_auth(registry.clone(), auth.clone()),
        None => Registrar::new(registry.clone()),
    });
    sip_server
        .register_handler(SipMethod::Register, registrar)
        .await;
    for method in [
        SipMethod::Invite,
        SipMethod::Ack,
        SipMethod::Bye,
        SipMethod::Cancel,
    ] {
        sip_server
            .register_handler(method, user_agent.clone())
            .await;
    }
    sip_server.set_response_handler(user_agent.clone()).await;
    sip_server
        .set_connection_loss_handler(Arc::new(ConnectionLossHandler::new(registry.clone())))
        .await;
    info!("Registered handlers: REGISTER, INVITE, ACK, CANCEL, BYE");

    // Each leg event is handled on its own task
    {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            while let Some((session, event)) = leg_events.recv().await {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    bridge.on_leg_event(session, event).await;
                });
            }
        });
    }

    let view = AdminView::new(accounts.clone(), registry.clone(), bridge.clone());

    let api_server_handle = match prometheus_handle {
        Some(prometheus_handle) => {
            let admin_bind = config.admin.bind_socket()?;
            let app = build_router(view.clone(), prometheus_handle);
            let listener = tokio::net::TcpListener::bind(admin_bind).await?;
            info!("Admin API listening on {}", admin_bind);

            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    error!("Admin API server failed: {}", e);
                }
            }))
        }
        None => None,
    };

    info!("B2BUA started, SIP on {}", bind);

    if config.console.enabled {
        let console = Console::new(view, logs.clone());
        tokio::select! {
            result = console.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => result?,
            result = tokio::signal::ctrl_c() => result?,
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }
    info!("Shutting down...");

    sip_server.stop().await?;

    if let Some(handle) = api_server_handle {
        handle.abort();
        info!("Admin API stopped");
    }

    Ok(())
}
