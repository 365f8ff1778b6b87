use std::{sync::Arc, time::Duration};

use clap::Parser;
use tandem_broker::{
    BearerSigner, CredentialTokenFinder, Delegate, DelegateConfig, Host, HostConfig, HostEvent,
    SessionEvent,
};
use tandem_clock::DurationSecs;
use tandem_sync::{LocalNamespace, SynchronizedResult};
use tandem_tokens::{
    ClientId, CredentialStore, HttpOAuth2Client, InMemoryCredentialStore, RefreshCoalescer,
    RefreshToken, Scopes, Token,
};
use tokio::{sync::broadcast, time};

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[arg(short, long, env)]
    token_url: reqwest::Url,

    /// The client ID of the application
    #[arg(short, long, env)]
    client_id: ClientId,

    /// The refresh token held by the application
    #[arg(short, long, env, hide_env_values = true)]
    refresh_token: RefreshToken,

    /// The scopes granted to the refresh token
    #[arg(long, env, default_value = "openid profile")]
    scopes: String,

    /// The scopes each delegate asks for, one delegate per value
    #[arg(short, long, default_values = ["openid", "profile", "openid"])]
    delegate_scopes: Vec<String>,

    /// How often each delegate asks for a token, in seconds
    #[arg(short, long, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let namespace = LocalNamespace::new();
    let app = namespace.actor("https://app.example.com");

    let client = reqwest::Client::builder().https_only(true).build()?;
    let authority = HttpOAuth2Client::new(client, opts.token_url, opts.client_id.clone());
    let coalescer = RefreshCoalescer::new(authority)
        .with_coordinator(SynchronizedResult::new(app.clone(), app.clone()));

    let store = Arc::new(InMemoryCredentialStore::new());
    let seed = Token::builder("", DurationSecs(0))
        .refresh_token(opts.refresh_token)
        .scopes(Scopes::from_space_delimited(&opts.scopes))
        .build();
    store
        .store(seed, Default::default())
        .await
        .map_err(|error| color_eyre::eyre::eyre!(error))?;

    let finder = CredentialTokenFinder::new(store, Arc::new(coalescer));
    let host = Host::new(HostConfig::new("broker"), app, finder, BearerSigner::new());

    let mut host_events = host.events();
    tokio::spawn(async move {
        while let Ok(event) = host_events.recv().await {
            match event {
                HostEvent::DuplicateHost { peer } => tracing::warn!(%peer, "duplicate host"),
                event => tracing::info!(?event, "host event"),
            }
        }
    });

    let (sessions, _) = broadcast::channel(1);
    let _logout = host.close_on_logout(sessions.subscribe());
    host.activate();

    for (n, scopes) in opts.delegate_scopes.into_iter().enumerate() {
        let delegate = Delegate::new(
            DelegateConfig::new("broker")
                .with_client_id(opts.client_id.clone())
                .with_scopes(Scopes::from_space_delimited(&scopes)),
            namespace.actor(format!("https://tab{n}.example.com")),
        );
        let period = Duration::from_secs(opts.interval);

        tokio::spawn(async move {
            if !delegate.ping_host().await {
                tracing::error!(tab = n, "host is not answering");
                return;
            }

            let mut interval = time::interval(period);
            loop {
                interval.tick().await;
                match delegate.get_token(None).await {
                    Ok(token) => tracing::info!(
                        tab = n,
                        token = format_args!("{:#?}", token.access_token()),
                        scopes = %token.scopes().to_space_delimited(),
                        expiry = token.expiry().0,
                        "pulled token"
                    ),
                    Err(error) => tracing::error!(tab = n, %error, "unable to get token"),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("signing out");
    let _ = sessions.send(SessionEvent::LoggedOut);
    time::sleep(Duration::from_millis(100)).await;

    Ok(())
}
