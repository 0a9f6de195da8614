use offline_player::api::{BackendClient, PlayReporter};
use offline_player::asset_cache::{CacheStorage, OfflineAssetCache};
use offline_player::config::{log_filter, Config};
use offline_player::connectivity::{Connectivity, ConnectivityProbe};
use offline_player::fetch::{Fetch, HttpFetcher};
use offline_player::player::media::RemoteMediaElement;
use offline_player::player::{PlayerCommand, PlayerController, PlayerHandle};
use offline_player::server::{self, AppState};
use offline_player::store::LocalAudioStore;
use reqwest::Client;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize Logging (RUST_LOG may come from .env)
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok()))
        .init();

    // 2. Load Config
    let config = Config::from_env()?;
    info!("Backend URL: {}", config.backend_url);
    info!("Data directory: {}", config.data_dir.display());

    // 3. Initialize HTTP Client
    let client = Client::builder().timeout(config.http_timeout).build()?;
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(client.clone(), &config.backend_url));
    let backend = BackendClient::new(client.clone(), &config.backend_url);

    // 4. Open the download store
    let store = Arc::new(LocalAudioStore::new(&config.data_dir, fetcher.clone()));
    store.open().await?;

    // 5. Install the app shell cache. Missing assets only cost offline
    //    support, so keep going.
    let assets = Arc::new(OfflineAssetCache::new(
        CacheStorage::new(config.data_dir.join("caches")),
        config.asset_cache_name.clone(),
        config.offline_assets.clone(),
        fetcher,
    ));
    match assets.prepare().await {
        Ok((count, dropped)) => info!("Cached {} assets, dropped {} old caches", count, dropped.len()),
        Err(e) => warn!("App shell not cached, older caches kept: {}", e),
    }

    // 6. Start the player
    let (events, _) = broadcast::channel(256);
    let (player, commands) = PlayerHandle::channel(64);
    let reporter: Arc<dyn PlayReporter> = Arc::new(backend.clone());
    let controller = PlayerController::new(
        RemoteMediaElement::new(events.clone()),
        config.user_id.clone(),
        store.clone(),
        reporter,
        events.clone(),
    );
    tokio::spawn(controller.run(commands));

    // 7. Watch connectivity; losing the network switches to downloads
    let probe = ConnectivityProbe::new(client, &config.probe_url, config.probe_interval);
    let online_hint = probe.online_hint();
    let (connectivity_tx, mut connectivity_rx) = watch::channel(Connectivity::Online);
    tokio::spawn(probe.run(connectivity_tx));
    {
        let player = player.clone();
        tokio::spawn(async move {
            while connectivity_rx.changed().await.is_ok() {
                let state = *connectivity_rx.borrow_and_update();
                if state == Connectivity::Offline {
                    if let Err(e) = player.send(PlayerCommand::ShowDownloads).await {
                        error!("Could not switch to downloads: {}", e);
                        return;
                    }
                }
            }
        });
    }

    let state = AppState {
        player,
        store,
        assets,
        backend,
        events,
        user_id: config.user_id,
        online_hint,
        previews: Default::default(),
    };

    // 8. Start Server
    let app = server::router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Player listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
