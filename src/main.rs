//! ticket-relay: run one realm role, or the client, from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use ticket_relay::bootstrap::{self, Responder};
use ticket_relay::config::RealmConfig;
use ticket_relay::lifetime::SystemClock;
use ticket_relay::roles::{AuthenticationService, RoleContext, ServiceEndpoint, TicketGrantingService};
use ticket_relay::transport::RoleListener;
use ticket_relay::{logging, observability, Client, CryptoProvider, FileKeyStore, KeyStore, Realm, SealedBoxProvider};

/// Ticket-based authentication realm
#[derive(Parser, Debug)]
#[command(name = "ticket-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to realm configuration file
    #[arg(short, long, default_value = "realm.toml")]
    config: PathBuf,

    /// Log filter (trace, debug, info, warn, error, or a full directive)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate and store a role's asymmetric identity
    Keygen {
        /// Role name
        role: String,
    },

    /// Answer bootstrap offers until every listed peer has one key
    BootstrapRespond {
        /// Responding role
        role: String,
        /// Peer roles to serve, in any order
        #[arg(long = "peer", required = true)]
        peers: Vec<String>,
        /// Listen address (defaults to the role's bootstrap endpoint)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Offer this role's public key to a responder and store the granted key
    BootstrapInitiate {
        /// Initiating role
        role: String,
        /// Responding role
        #[arg(long)]
        peer: String,
        /// Responder address (defaults to the peer's bootstrap endpoint)
        #[arg(long)]
        to: Option<String>,
    },

    /// Run the authentication role
    ServeAs,

    /// Run the ticket-granting role
    ServeTgs,

    /// Run a protected service
    ServeService {
        /// Service identity (defaults to the configured one)
        #[arg(long)]
        name: Option<String>,
    },

    /// Authenticate and access a service
    Client {
        /// Service to access
        #[arg(long)]
        service: String,
        /// Service address (defaults to the configured service endpoint)
        #[arg(long)]
        service_addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref());

    let config = RealmConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Keygen { role } => keygen(&config, &role).await,
        Commands::BootstrapRespond { role, peers, listen } => {
            bootstrap_respond(&config, &role, peers, listen).await
        }
        Commands::BootstrapInitiate { role, peer, to } => bootstrap_initiate(&config, &role, &peer, to).await,
        Commands::ServeAs => serve_as(&config).await,
        Commands::ServeTgs => serve_tgs(&config).await,
        Commands::ServeService { name } => serve_service(&config, name).await,
        Commands::Client { service, service_addr } => run_client(&config, &service, service_addr).await,
    }
}

async fn open_store(dir: &Path) -> Result<Arc<dyn KeyStore>> {
    let store = FileKeyStore::open(dir)
        .await
        .with_context(|| format!("opening key store at {}", dir.display()))?;
    Ok(Arc::new(store))
}

async fn context(config: &RealmConfig, identity: &str) -> Result<RoleContext> {
    Ok(RoleContext::new(
        identity,
        open_store(&config.key_dir).await?,
        Arc::new(SealedBoxProvider::new()),
        Arc::new(SystemClock),
    ))
}

/// Bootstrap endpoint of the role that answers offers, if it has one.
fn bootstrap_endpoint(config: &RealmConfig, role: &str) -> Option<String> {
    let ids = &config.identities;
    let endpoints = &config.endpoints;
    if role == ids.authentication {
        Some(endpoints.bootstrap_authentication.address())
    } else if role == ids.ticket_granting {
        Some(endpoints.bootstrap_ticket_granting.address())
    } else {
        None
    }
}

async fn keygen(config: &RealmConfig, role: &str) -> Result<()> {
    let store = open_store(&config.key_dir).await?;
    let public = bootstrap::create_identity(store.as_ref(), &SealedBoxProvider::new(), role).await?;
    info!(role, public = %public.to_base64(), "identity stored");
    Ok(())
}

async fn bootstrap_respond(config: &RealmConfig, role: &str, peers: Vec<String>, listen: Option<String>) -> Result<()> {
    let Some(addr) = listen.or_else(|| bootstrap_endpoint(config, role)) else {
        bail!("no bootstrap endpoint configured for `{role}`; pass --listen");
    };
    let listener = RoleListener::bind_to(role, &addr).await?;
    let crypto: Arc<dyn CryptoProvider> = Arc::new(SealedBoxProvider::new());
    let responder = Responder::new(role, peers, open_store(&config.key_dir).await?, crypto);
    bootstrap::respond_to_peers(&listener, &responder).await?;
    Ok(())
}

async fn bootstrap_initiate(config: &RealmConfig, role: &str, peer: &str, to: Option<String>) -> Result<()> {
    let Some(addr) = to.or_else(|| bootstrap_endpoint(config, peer)) else {
        bail!("no bootstrap endpoint configured for `{peer}`; pass --to");
    };
    let store = open_store(&config.key_dir).await?;
    bootstrap::initiate(store.as_ref(), &SealedBoxProvider::new(), role, peer, &addr)
        .await
        .with_context(|| format!("bootstrap {role} -> {peer} at {addr}"))?;
    Ok(())
}

async fn serve_as(config: &RealmConfig) -> Result<()> {
    let ids = &config.identities;
    let ctx = context(config, &ids.authentication).await?;
    let handler = AuthenticationService::new(ctx, ids.ticket_granting.clone(), config.windows.grant());
    let listener = RoleListener::bind_to(&ids.authentication, &config.endpoints.authentication.address()).await?;
    listener.serve(Arc::new(handler)).await?;
    Ok(())
}

async fn serve_tgs(config: &RealmConfig) -> Result<()> {
    let ids = &config.identities;
    let ctx = context(config, &ids.ticket_granting).await?;
    let handler = TicketGrantingService::new(
        ctx,
        ids.authentication.clone(),
        config.windows.service(),
        config.windows.skew(),
    );
    let listener = RoleListener::bind_to(&ids.ticket_granting, &config.endpoints.ticket_granting.address()).await?;
    listener.serve(Arc::new(handler)).await?;
    Ok(())
}

async fn serve_service(config: &RealmConfig, name: Option<String>) -> Result<()> {
    let ids = &config.identities;
    let name = name.unwrap_or_else(|| ids.service.clone());
    let ctx = context(config, &name).await?;
    let handler = ServiceEndpoint::new(
        ctx,
        ids.ticket_granting.clone(),
        config.approval_marker.clone(),
        config.windows.skew(),
    );
    let listener = RoleListener::bind_to(&name, &config.endpoints.service.address()).await?;
    listener.serve(Arc::new(handler)).await?;
    Ok(())
}

async fn run_client(config: &RealmConfig, service: &str, service_addr: Option<String>) -> Result<()> {
    let ids = &config.identities;
    let endpoints = &config.endpoints;
    let realm = Realm {
        authentication: ids.authentication.clone(),
        authentication_addr: endpoints.authentication.address(),
        ticket_granting: ids.ticket_granting.clone(),
        ticket_granting_addr: endpoints.ticket_granting.address(),
    };
    let client = Client::new(context(config, &ids.client).await?, realm, config.windows.requested())
        .with_address(config.client_address);
    let service_addr = service_addr.unwrap_or_else(|| endpoints.service.address());

    let approval = client
        .run(service, &service_addr)
        .await
        .with_context(|| format!("accessing `{service}`"))?;
    let stats = observability::snapshot();
    info!(
        service = %approval.service,
        marker = %approval.marker,
        frames_sent = stats.frames_sent,
        "access granted"
    );
    Ok(())
}
