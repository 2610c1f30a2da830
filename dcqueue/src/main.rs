use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use dcqueue::{Catalogue, Config, Core, SqliteCatalogue};

#[tokio::main]
async fn main() {
    // Set up logging.
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let config = Config::default();
    let catalogue: Arc<dyn Catalogue> = match SqliteCatalogue::open(&config.catalogue_path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!(error = %e, "failed to open catalogue");
            return;
        }
    };

    if let Some(xml_path) = &config.legacy_queue_xml {
        if xml_path.exists() {
            match dcqueue::legacy_xml::parse(xml_path) {
                Ok(items) => {
                    if let Err(e) = catalogue.merge_queue_all_items(&items) {
                        tracing::warn!(error = %e, "failed to import legacy queue");
                    } else if let Err(e) = std::fs::remove_file(xml_path) {
                        tracing::warn!(error = %e, "failed to delete legacy queue file after import");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to parse legacy queue XML"),
            }
        }
    }

    let core = Arc::new(Core::new(config, catalogue));
    match core.load_from_catalogue().await {
        Ok(n) => tracing::info!(items = n, "loaded queue from catalogue"),
        Err(e) => tracing::error!(error = %e, "failed to load queue from catalogue"),
    }

    core.start_preview().await;
    if let Err(e) = core
        .start_pfs(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), "dcqueue".to_string(), String::new())
        .await
    {
        tracing::warn!(error = %e, "failed to start PFS protocol");
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");
    core.shutdown().await;
}
