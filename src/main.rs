//! Interactive demo: scan for BlueST nodes, connect to one, pick a
//! feature and forward a bounded number of samples to the cloud.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use sensortile_cloud::utils::parse_selection;
use sensortile_cloud::{
    CloudClient, CloudConfig, Feature, FeatureKind, Manager, Node, Result, SampleForwarder,
};

/// Presentation banner.
const INTRO: &str = "####################
# sensortile-cloud #
####################";

/// Bluetooth scanning time.
const SCANNING_TIME: Duration = Duration::from_secs(5);

/// Poll interval while waiting for samples to be forwarded.
const WAIT_POLL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("\n{}\n", INTRO);

    tokio::select! {
        result = run() => {
            if let Err(e) = result {
                println!("{}", e);
                println!("Exiting...\n");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nExiting...\n");
        }
    }

    // Every exit path reports success, including BLE errors and interrupts
    std::process::exit(0);
}

async fn run() -> Result<()> {
    let manager = Manager::new().await?;

    let _discovery_handle = manager.on_discovery_change(|enabled| {
        println!("Discovery {}.", if enabled { "started" } else { "stopped" });
        if !enabled {
            println!();
        }
    });

    let _node_handle = manager.on_node_discovered(|node| {
        println!("New device discovered: {}.", node.name());
    });

    loop {
        println!("Scanning Bluetooth devices...\n");
        manager.discover(SCANNING_TIME).await?;

        let nodes = manager.nodes();

        if nodes.is_empty() {
            println!("\nNo Bluetooth devices found.");
            return Ok(());
        }

        println!("\nAvailable Bluetooth devices:");
        for (i, node) in nodes.iter().enumerate() {
            println!("{}) {}: [{}]", i + 1, node.name(), node.tag());
        }

        let choice = prompt_selection("\nSelect a device ('0' to quit): ", nodes.len()).await;
        if choice == 0 {
            println!("Exiting...\n");
            return Ok(());
        }
        let node = nodes[choice - 1].clone();

        let node_name = node.name();
        let _status_handle = node.on_status_change(move |old, new| {
            println!("Device {} went from {} to {}.", node_name, old, new);
        });

        println!("\nConnecting to {}...", node.name());
        node.connect().await?;
        println!("Connection done.");

        loop {
            let features = listable_features(&node);

            println!("\nFeatures:");
            for (i, feature) in features.iter().enumerate() {
                println!("{}) {}", i + 1, menu_label(feature.kind()));
            }

            let choice =
                prompt_selection("\nSelect a feature ('0' to disconnect): ", features.len()).await;
            if choice == 0 {
                println!("\nDisconnecting from {}...", node.name());
                node.disconnect().await?;
                println!("Disconnection done.");
                manager.reset_discovery();
                break;
            }
            let feature = features[choice - 1].clone();

            stream_feature(&node, &feature).await?;
        }
    }
}

/// Features offered in the menu.
///
/// The ADPCM sync stream is never listed on its own; it rides along with
/// the audio stream as a single "Audio & Sync" entry.
fn listable_features(node: &Node) -> Vec<Arc<Feature>> {
    node.features()
        .into_iter()
        .filter(|f| f.kind() != FeatureKind::AudioAdpcmSync)
        .collect()
}

/// Menu label for a feature entry.
fn menu_label(kind: FeatureKind) -> &'static str {
    match kind {
        FeatureKind::AudioAdpcm => "Audio & Sync",
        kind => kind.name(),
    }
}

/// Subscribe to a feature, forward the capped number of samples to the
/// cloud, then tear everything down again.
async fn stream_feature(node: &Node, feature: &Arc<Feature>) -> Result<()> {
    let cloud = Arc::new(CloudClient::new(CloudConfig::from_env()));
    cloud.connect().await?;

    let forwarder = Arc::new(SampleForwarder::new(cloud.clone()));

    let forwarder_cb = forwarder.clone();
    let feature_cb = feature.clone();
    let update_handle = feature.on_update(move |sample| {
        let forwarder = forwarder_cb.clone();
        let feature = feature_cb.clone();
        let sample = sample.clone();
        tokio::spawn(async move {
            match forwarder.handle(feature.name(), &sample).await {
                Ok(true) => println!("{}", feature),
                Ok(false) => {}
                Err(e) => eprintln!("Failed to publish sample: {}", e),
            }
        });
    });

    node.enable_notifications(feature).await?;

    // The audio stream is useless without its sync stream, so the paired
    // feature is enabled alongside (but not forwarded to the cloud)
    let paired = match feature.kind() {
        FeatureKind::AudioAdpcm => node.get_feature(FeatureKind::AudioAdpcmSync),
        FeatureKind::AudioAdpcmSync => node.get_feature(FeatureKind::AudioAdpcm),
        _ => None,
    };
    if let Some(paired) = &paired {
        node.enable_notifications(paired).await?;
    }

    while !forwarder.is_complete() {
        if !node.is_connected() {
            break;
        }
        tokio::time::sleep(WAIT_POLL).await;
    }

    node.disable_notifications(feature).await?;
    if let Some(paired) = &paired {
        node.disable_notifications(paired).await?;
    }

    update_handle.unregister();
    cloud.disconnect().await?;

    Ok(())
}

/// Prompt for a menu selection in `[0, max]`.
///
/// Out-of-range and unparsable input re-prompts; end of input counts as
/// `0` (go back / quit).
async fn prompt_selection(prompt: &str, max: usize) -> usize {
    loop {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|n| (n, line))
        })
        .await;

        match line {
            Ok(Ok((0, _))) => return 0,
            Ok(Ok((_, line))) => {
                if let Some(choice) = parse_selection(&line, max) {
                    return choice;
                }
            }
            _ => return 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_menu_label_audio_is_paired_entry() {
        assert_eq!(menu_label(FeatureKind::AudioAdpcm), "Audio & Sync");
    }

    #[test]
    fn test_menu_label_plain_features() {
        assert_eq!(menu_label(FeatureKind::Temperature), "Temperature");
        assert_eq!(menu_label(FeatureKind::Pressure), "Pressure");
    }
}
